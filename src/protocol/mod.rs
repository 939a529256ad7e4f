//! Protocol module - wire primitives, record layouts, and framing.
//!
//! Everything on the wire is big-endian and fixed-layout:
//! - primitive field codec in [`wire`]
//! - struct-per-record encode/decode in [`records`]
//! - length-prefixed frame accumulation in [`frame_buffer`]

pub mod frame_buffer;
pub mod records;
pub mod wire;

pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use records::{
    Acl, AuthRequest, ConnectRequest, ConnectResponse, CreateMode, CreateRequest, CreateResponse,
    DeleteRequest, ExistsRequest, ExistsResponse, GetAclRequest, GetAclResponse,
    GetChildren2Response, GetChildrenRequest, GetChildrenResponse, GetDataRequest, GetDataResponse,
    OpCode, ReplyHeader, RequestHeader, SetAclRequest, SetAclResponse, SetDataRequest,
    SetDataResponse, SetWatchesRequest, Stat, WatcherEvent, AUTH_XID, PASSWD_LEN, PING_XID,
    SET_WATCHES_XID, WATCHER_EVENT_XID,
};
