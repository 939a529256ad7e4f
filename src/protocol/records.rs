//! Protocol records.
//!
//! Each record is a struct whose fields encode in declaration order using
//! the primitives in [`super::wire`]. Request frames are
//! `{xid, opcode, body}`; response frames are `{xid, zxid, err, body}`.
//! The connect handshake frames carry neither header.

use bytes::{Buf, BytesMut};

use super::wire;
use crate::error::DecodeError;

/// Reserved xid for out-of-band watcher event notifications.
pub const WATCHER_EVENT_XID: i32 = -1;
/// Reserved xid for ping frames.
pub const PING_XID: i32 = -2;
/// Reserved xid for auth frames.
pub const AUTH_XID: i32 = -4;
/// Reserved xid for the set-watches replay frame.
pub const SET_WATCHES_XID: i32 = -8;

/// Length of a session password.
pub const PASSWD_LEN: usize = 16;

/// Protocol operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetAcl = 6,
    SetAcl = 7,
    GetChildren = 8,
    Sync = 9,
    Ping = 11,
    GetChildren2 = 12,
    Check = 13,
    Multi = 14,
    Auth = 100,
    SetWatches = 101,
    CreateSession = -10,
    CloseSession = -11,
}

/// Flags for node creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CreateMode {
    Persistent = 0,
    Ephemeral = 1,
    PersistentSequential = 2,
    EphemeralSequential = 3,
}

impl CreateMode {
    /// Whether the server appends a sequence suffix to the created path.
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// ACL permission bits.
pub mod perms {
    pub const READ: i32 = 1 << 0;
    pub const WRITE: i32 = 1 << 1;
    pub const CREATE: i32 = 1 << 2;
    pub const DELETE: i32 = 1 << 3;
    pub const ADMIN: i32 = 1 << 4;
    pub const ALL: i32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// An access-control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub perms: i32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub fn new(perms: i32, scheme: &str, id: &str) -> Self {
        Self {
            perms,
            scheme: scheme.to_string(),
            id: id.to_string(),
        }
    }

    /// Completely open node: anyone may do anything.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::ALL, "world", "anyone")]
    }

    /// Anyone may read; nothing else is granted.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(perms::READ, "world", "anyone")]
    }

    /// Full permissions for the creator's authenticated identity.
    pub fn creator_all() -> Vec<Acl> {
        vec![Acl::new(perms::ALL, "auth", "")]
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.perms);
        wire::write_string(buf, &self.scheme);
        wire::write_string(buf, &self.id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            perms: wire::read_i32(buf)?,
            scheme: wire::read_string(buf)?,
            id: wire::read_string(buf)?,
        })
    }
}

fn write_acl_vec(buf: &mut BytesMut, acl: &[Acl]) {
    wire::write_i32(buf, acl.len() as i32);
    for a in acl {
        a.encode(buf);
    }
}

fn read_acl_vec(buf: &mut impl Buf) -> Result<Vec<Acl>, DecodeError> {
    let count = wire::read_i32(buf)?;
    if count == -1 {
        return Ok(Vec::new());
    }
    if count < 0 {
        return Err(DecodeError::NegativeLength(count));
    }
    let count = count as usize;
    // An entry is at least 12 bytes: perms plus two length prefixes.
    if buf.remaining() < count.saturating_mul(12) {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Acl::decode(buf)?);
    }
    Ok(out)
}

/// Versioned metadata attached to every znode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

impl Stat {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i64(buf, self.czxid);
        wire::write_i64(buf, self.mzxid);
        wire::write_i64(buf, self.ctime);
        wire::write_i64(buf, self.mtime);
        wire::write_i32(buf, self.version);
        wire::write_i32(buf, self.cversion);
        wire::write_i32(buf, self.aversion);
        wire::write_i64(buf, self.ephemeral_owner);
        wire::write_i32(buf, self.data_length);
        wire::write_i32(buf, self.num_children);
        wire::write_i64(buf, self.pzxid);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            czxid: wire::read_i64(buf)?,
            mzxid: wire::read_i64(buf)?,
            ctime: wire::read_i64(buf)?,
            mtime: wire::read_i64(buf)?,
            version: wire::read_i32(buf)?,
            cversion: wire::read_i32(buf)?,
            aversion: wire::read_i32(buf)?,
            ephemeral_owner: wire::read_i64(buf)?,
            data_length: wire::read_i32(buf)?,
            num_children: wire::read_i32(buf)?,
            pzxid: wire::read_i64(buf)?,
        })
    }
}

/// Session handshake request. Sent without a request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.protocol_version);
        wire::write_i64(buf, self.last_zxid_seen);
        wire::write_i32(buf, self.timeout_ms);
        wire::write_i64(buf, self.session_id);
        wire::write_buffer(buf, Some(&self.passwd));
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: wire::read_i32(buf)?,
            last_zxid_seen: wire::read_i64(buf)?,
            timeout_ms: wire::read_i32(buf)?,
            session_id: wire::read_i64(buf)?,
            passwd: wire::read_buffer(buf)?.unwrap_or_default(),
        })
    }
}

/// Session handshake reply. Carries neither xid nor err.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.protocol_version);
        wire::write_i32(buf, self.timeout_ms);
        wire::write_i64(buf, self.session_id);
        wire::write_buffer(buf, Some(&self.passwd));
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: wire::read_i32(buf)?,
            timeout_ms: wire::read_i32(buf)?,
            session_id: wire::read_i64(buf)?,
            passwd: wire::read_buffer(buf)?.unwrap_or_default(),
        })
    }
}

/// `{xid, opcode}` prefix of every ordinary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: i32,
    pub opcode: OpCode,
}

impl RequestHeader {
    pub fn new(xid: i32, opcode: OpCode) -> Self {
        Self { xid, opcode }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.xid);
        wire::write_i32(buf, self.opcode as i32);
    }
}

/// `{xid, zxid, err}` prefix of every ordinary response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.xid);
        wire::write_i64(buf, self.zxid);
        wire::write_i32(buf, self.err);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            xid: wire::read_i32(buf)?,
            zxid: wire::read_i64(buf)?,
            err: wire::read_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub flags: i32,
}

impl CreateRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_buffer(buf, Some(&self.data));
        write_acl_vec(buf, &self.acl);
        wire::write_i32(buf, self.flags);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            data: wire::read_buffer(buf)?.unwrap_or_default(),
            acl: read_acl_vec(buf)?,
            flags: wire::read_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub path: String,
}

impl CreateResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

impl DeleteRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_i32(buf, self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            version: wire::read_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistsRequest {
    pub path: String,
    pub watch: bool,
}

impl ExistsRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_bool(buf, self.watch);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            watch: wire::read_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistsResponse {
    pub stat: Stat,
}

impl ExistsResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            stat: Stat::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataRequest {
    pub path: String,
    pub watch: bool,
}

impl GetDataRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_bool(buf, self.watch);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            watch: wire::read_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataResponse {
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl GetDataResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_buffer(buf, Some(&self.data));
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            data: wire::read_buffer(buf)?.unwrap_or_default(),
            stat: Stat::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

impl SetDataRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_buffer(buf, Some(&self.data));
        wire::write_i32(buf, self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            data: wire::read_buffer(buf)?.unwrap_or_default(),
            version: wire::read_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDataResponse {
    pub stat: Stat,
}

impl SetDataResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            stat: Stat::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAclRequest {
    pub path: String,
}

impl GetAclRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAclResponse {
    pub acl: Vec<Acl>,
    pub stat: Stat,
}

impl GetAclResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        write_acl_vec(buf, &self.acl);
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            acl: read_acl_vec(buf)?,
            stat: Stat::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAclRequest {
    pub path: String,
    pub acl: Vec<Acl>,
    pub version: i32,
}

impl SetAclRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        write_acl_vec(buf, &self.acl);
        wire::write_i32(buf, self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            acl: read_acl_vec(buf)?,
            version: wire::read_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetAclResponse {
    pub stat: Stat,
}

impl SetAclResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            stat: Stat::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChildrenRequest {
    pub path: String,
    pub watch: bool,
}

impl GetChildrenRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string(buf, &self.path);
        wire::write_bool(buf, self.watch);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            path: wire::read_string(buf)?,
            watch: wire::read_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChildrenResponse {
    pub children: Vec<String>,
}

impl GetChildrenResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string_vec(buf, &self.children);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            children: wire::read_string_vec(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChildren2Response {
    pub children: Vec<String>,
    pub stat: Stat,
}

impl GetChildren2Response {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_string_vec(buf, &self.children);
        self.stat.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            children: wire::read_string_vec(buf)?,
            stat: Stat::decode(buf)?,
        })
    }
}

/// Re-arms server-side watches after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetWatchesRequest {
    pub relative_zxid: i64,
    pub data_watches: Vec<String>,
    pub exist_watches: Vec<String>,
    pub child_watches: Vec<String>,
}

impl SetWatchesRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i64(buf, self.relative_zxid);
        wire::write_string_vec(buf, &self.data_watches);
        wire::write_string_vec(buf, &self.exist_watches);
        wire::write_string_vec(buf, &self.child_watches);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            relative_zxid: wire::read_i64(buf)?,
            data_watches: wire::read_string_vec(buf)?,
            exist_watches: wire::read_string_vec(buf)?,
            child_watches: wire::read_string_vec(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth_type: i32,
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.auth_type);
        wire::write_string(buf, &self.scheme);
        wire::write_buffer(buf, Some(&self.auth));
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            auth_type: wire::read_i32(buf)?,
            scheme: wire::read_string(buf)?,
            auth: wire::read_buffer(buf)?.unwrap_or_default(),
        })
    }
}

/// Out-of-band change notification, delivered under xid -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl WatcherEvent {
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::write_i32(buf, self.event_type);
        wire::write_i32(buf, self.state);
        wire::write_string(buf, &self.path);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            event_type: wire::read_i32(buf)?,
            state: wire::read_i32(buf)?,
            path: wire::read_string(buf)?,
        })
    }
}
