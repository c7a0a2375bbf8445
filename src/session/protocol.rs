//! Agent wire protocol.
//!
//! Every message travels in one frame:
//!
//! ```text
//! [4-byte length (little-endian)][payload type: u8][payload]
//! ```
//!
//! Integers are little-endian, strings are UTF-8 with a `u32` byte-length
//! prefix, byte arrays and arrays carry a `u32` count prefix. Versioned
//! payloads start with their own version byte; an unknown version means the
//! process speaks an incompatible agent and is never retried.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClientError, ProtocolError};
use crate::update::{Capabilities, ModuleId, StaticAsset, Update};

pub const HANDSHAKE_VERSION: u8 = 0;
pub const MANAGED_CODE_UPDATE_VERSION: u8 = 0;
pub const STATIC_ASSET_UPDATE_VERSION: u8 = 0;

/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Payloads sent to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    ManagedCodeUpdate = 1,
    StaticAssetUpdate = 2,
    InitialUpdatesCompleted = 3,
}

impl TryFrom<u8> for RequestType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RequestType::ManagedCodeUpdate),
            2 => Ok(RequestType::StaticAssetUpdate),
            3 => Ok(RequestType::InitialUpdatesCompleted),
            other => Err(ProtocolError::UnknownPayloadType(other)),
        }
    }
}

/// Payloads sent by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Handshake = 1,
    UpdateResponse = 2,
    /// The runtime rejected an applied update; sent in place of an update response.
    HotReloadException = 3,
}

impl TryFrom<u8> for ResponseType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ResponseType::Handshake),
            2 => Ok(ResponseType::UpdateResponse),
            3 => Ok(ResponseType::HotReloadException),
            other => Err(ProtocolError::UnknownPayloadType(other)),
        }
    }
}

/// How chatty the process should be in its update responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoggingLevel {
    #[default]
    WarningsAndErrors = 0,
    Verbose = 1,
}

impl TryFrom<u8> for LoggingLevel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LoggingLevel::WarningsAndErrors),
            1 => Ok(LoggingLevel::Verbose),
            other => Err(ProtocolError::UnknownLoggingLevel(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentSeverity {
    Verbose = 1,
    Warning = 2,
    Error = 3,
}

impl TryFrom<u8> for AgentSeverity {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(AgentSeverity::Verbose),
            2 => Ok(AgentSeverity::Warning),
            3 => Ok(AgentSeverity::Error),
            other => Err(ProtocolError::UnknownSeverity(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub severity: AgentSeverity,
}

impl LogEntry {
    pub fn new(severity: AgentSeverity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// The process's answer to a managed code or static asset update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResponse {
    pub success: bool,
    pub log: Vec<LogEntry>,
}

/// Raised by the runtime when an update it accepted cannot be applied after all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotReloadException {
    pub code: i32,
    pub message: String,
}

/// A request as seen by the process side of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    ManagedCodeUpdate {
        updates: Vec<Update>,
        logging: LoggingLevel,
    },
    StaticAssetUpdate {
        asset: StaticAsset,
        logging: LoggingLevel,
    },
    InitialUpdatesCompleted,
}

/// A response as seen by the coordinator side of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Handshake(Capabilities),
    Update(UpdateResponse),
    Exception(HotReloadException),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Builds one payload (type byte first).
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new(payload_type: u8) -> Self {
        Self {
            buf: vec![payload_type],
        }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(u8::from(value))
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn len_prefix(&mut self, len: usize) -> &mut Self {
        // Frames are capped well below u32::MAX, so saturation never reaches the wire
        self.u32(u32::try_from(len).unwrap_or(u32::MAX))
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.len_prefix(value.len());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn module_id(&mut self, id: &ModuleId) -> &mut Self {
        self.buf.extend_from_slice(id.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub fn encode_managed_code_update<'a, I>(updates: I, logging: LoggingLevel) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Update>,
    I::IntoIter: ExactSizeIterator,
{
    let updates = updates.into_iter();
    let mut w = PayloadWriter::new(RequestType::ManagedCodeUpdate as u8);
    w.u8(MANAGED_CODE_UPDATE_VERSION).len_prefix(updates.len());

    for update in updates {
        w.module_id(&update.module_id)
            .bytes(&update.metadata_delta)
            .bytes(&update.code_delta)
            .bytes(&update.debug_delta)
            .len_prefix(update.updated_types.len());
        for type_id in &update.updated_types {
            w.i32(*type_id);
        }
    }

    w.u8(logging as u8);
    w.finish()
}

pub fn encode_static_asset_update(asset: &StaticAsset, logging: LoggingLevel) -> Vec<u8> {
    let mut w = PayloadWriter::new(RequestType::StaticAssetUpdate as u8);
    w.u8(STATIC_ASSET_UPDATE_VERSION)
        .string(&asset.assembly_name)
        .bool(asset.is_application_asset)
        .string(&asset.relative_path)
        .bytes(&asset.contents)
        .u8(logging as u8);
    w.finish()
}

pub fn encode_initial_updates_completed() -> Vec<u8> {
    PayloadWriter::new(RequestType::InitialUpdatesCompleted as u8).finish()
}

pub fn encode_handshake(capabilities: &Capabilities) -> Vec<u8> {
    let mut w = PayloadWriter::new(ResponseType::Handshake as u8);
    w.u8(HANDSHAKE_VERSION).string(&capabilities.to_string());
    w.finish()
}

pub fn encode_update_response(response: &UpdateResponse) -> Vec<u8> {
    let mut w = PayloadWriter::new(ResponseType::UpdateResponse as u8);
    w.bool(response.success).len_prefix(response.log.len());
    for entry in &response.log {
        w.string(&entry.message).u8(entry.severity as u8);
    }
    w.finish()
}

pub fn encode_hot_reload_exception(exception: &HotReloadException) -> Vec<u8> {
    let mut w = PayloadWriter::new(ResponseType::HotReloadException as u8);
    w.i32(exception.code).string(&exception.message);
    w.finish()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Cursor over one payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(ProtocolError::Truncated {
                needed: len - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidBool(other)),
        }
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Element count, checked against what is left so a bogus prefix cannot
    /// trigger a huge allocation.
    pub fn count(&mut self, min_element_size: usize) -> Result<usize, ProtocolError> {
        let count = self.u32()? as usize;
        let remaining = self.buf.len() - self.pos;
        let needed = count.saturating_mul(min_element_size.max(1));
        if needed > remaining {
            return Err(ProtocolError::Truncated {
                needed: needed - remaining,
            });
        }
        Ok(count)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        String::from_utf8(self.bytes()?).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn module_id(&mut self) -> Result<ModuleId, ProtocolError> {
        Ok(ModuleId::from_bytes(self.array()?))
    }

    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            trailing => Err(ProtocolError::TrailingBytes(trailing)),
        }
    }
}

fn expect_version(
    r: &mut PayloadReader<'_>,
    payload: &'static str,
    supported: u8,
) -> Result<(), ProtocolError> {
    let version = r.u8()?;
    if version != supported {
        return Err(ProtocolError::UnsupportedVersion { payload, version });
    }
    Ok(())
}

impl AgentRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let request = match RequestType::try_from(r.u8()?)? {
            RequestType::ManagedCodeUpdate => {
                expect_version(&mut r, "managed code update", MANAGED_CODE_UPDATE_VERSION)?;
                // module id + three empty arrays + empty type list
                let count = r.count(16 + 4 * 4)?;
                let mut updates = Vec::with_capacity(count);
                for _ in 0..count {
                    let module_id = r.module_id()?;
                    let metadata = r.bytes()?;
                    let code = r.bytes()?;
                    let debug = r.bytes()?;
                    let type_count = r.count(4)?;
                    let mut types = Vec::with_capacity(type_count);
                    for _ in 0..type_count {
                        types.push(r.i32()?);
                    }
                    updates.push(
                        Update::new(module_id)
                            .with_deltas(metadata, code, debug)
                            .with_updated_types(types),
                    );
                }
                let logging = LoggingLevel::try_from(r.u8()?)?;
                AgentRequest::ManagedCodeUpdate { updates, logging }
            }
            RequestType::StaticAssetUpdate => {
                expect_version(&mut r, "static asset update", STATIC_ASSET_UPDATE_VERSION)?;
                let asset = StaticAsset {
                    assembly_name: r.string()?,
                    is_application_asset: r.bool()?,
                    relative_path: r.string()?,
                    contents: r.bytes()?,
                };
                let logging = LoggingLevel::try_from(r.u8()?)?;
                AgentRequest::StaticAssetUpdate { asset, logging }
            }
            RequestType::InitialUpdatesCompleted => AgentRequest::InitialUpdatesCompleted,
        };
        r.finish()?;
        Ok(request)
    }
}

impl AgentResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let response = match ResponseType::try_from(r.u8()?)? {
            ResponseType::Handshake => {
                expect_version(&mut r, "capability handshake", HANDSHAKE_VERSION)?;
                AgentResponse::Handshake(Capabilities::parse(&r.string()?))
            }
            ResponseType::UpdateResponse => {
                let success = r.bool()?;
                let count = r.count(5)?;
                let mut log = Vec::with_capacity(count);
                for _ in 0..count {
                    let message = r.string()?;
                    let severity = AgentSeverity::try_from(r.u8()?)?;
                    log.push(LogEntry { message, severity });
                }
                AgentResponse::Update(UpdateResponse { success, log })
            }
            ResponseType::HotReloadException => AgentResponse::Exception(HotReloadException {
                code: r.i32()?,
                message: r.string()?,
            }),
        };
        r.finish()?;
        Ok(response)
    }

    pub fn payload_type(&self) -> ResponseType {
        match self {
            AgentResponse::Handshake(_) => ResponseType::Handshake,
            AgentResponse::Update(_) => ResponseType::UpdateResponse,
            AgentResponse::Exception(_) => ResponseType::HotReloadException,
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][payload]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a payload with its length prefix
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut result = Vec::with_capacity(4 + payload.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(payload);
        result
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }
}

/// Write one frame and flush it; the request is fully on the wire when this returns.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()).into());
    }
    writer.write_all(&MessageFrame::encode(payload)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);
    tracing::trace!(len, "Agent frame length");

    if len == 0 {
        return Err(ProtocolError::EmptyFrame.into());
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn read_response<R>(reader: &mut R) -> Result<AgentResponse, ClientError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    Ok(AgentResponse::decode(&payload)?)
}

pub async fn read_request<R>(reader: &mut R) -> Result<AgentRequest, ClientError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    Ok(AgentRequest::decode(&payload)?)
}
