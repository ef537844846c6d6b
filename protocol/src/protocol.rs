use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Version of the wire protocol. A client that sees a different value in the
/// hello payload must abort.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single frame in either direction.
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// WebSocket close code sent after a failed `connect`.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4001;

/// Interval between `tick` keepalive events.
pub const TICK_INTERVAL_SECS: u64 = 30;

/// Capability level of a workspace. The order of the variants is the total
/// order `read < write < exec` that the dispatcher compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Read,
    Write,
    Exec,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Read => write!(f, "read"),
            Tier::Write => write!(f, "write"),
            Tier::Exec => write!(f, "exec"),
        }
    }
}

/// The closed set of error codes visible on the wire.
///
/// The first group is produced by the tool layer; the second group by the
/// session layer. Every failed response carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ForbiddenPath,
    PathNotFound,
    InvalidPath,
    CommandDenied,
    PatchFailed,
    VcsError,
    CommandFailed,
    CommandTimeout,
    ApprovalRequired,
    ApprovalDenied,
    ApprovalTimeout,
    Unauthorized,
    PayloadTooLarge,
    MethodNotFound,
    InternalError,

    AuthFailed,
    ParseError,
    InvalidRequest,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde rename so logs and frames agree.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{s}")
    }
}

/// Error object carried inside a failed response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Client-chosen request id, echoed verbatim in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// One frame = one UTF-8 JSON message on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// `None` only for failures that could not be tied to a request, e.g. a
    /// frame that did not parse at all. Serialised as JSON `null`.
    pub id: Option<RequestId>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseFrame {
    pub fn success(id: RequestId, payload: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: WireError) -> Self {
        Self {
            id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
    /// Assigned by the server just before the frame is written, strictly
    /// increasing per session.
    pub seq: u64,
}

/// An event that has not yet been stamped with a session sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

pub const EVENT_TOOL: &str = "tool";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_APPROVAL_REQUEST: &str = "approval.request";
pub const EVENT_APPROVAL_RESOLVED: &str = "approval.resolved";

/// Methods a client may invoke. Everything except `connect` requires an
/// authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    ToolsList,
    ToolsCall,
    Ping,
    ApprovalsList,
    ApprovalsResolve,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::ToolsList => "tools.list",
            Method::ToolsCall => "tools.call",
            Method::Ping => "ping",
            Method::ApprovalsList => "approvals.list",
            Method::ApprovalsResolve => "approvals.resolve",
        }
    }

    pub const ALL: [Method; 6] = [
        Method::Connect,
        Method::ToolsList,
        Method::ToolsCall,
        Method::Ping,
        Method::ApprovalsList,
        Method::ApprovalsResolve,
    ];
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Payload of the successful `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub protocol: u32,
    pub server: ServerInfo,
    pub workspace: WorkspaceInfo,
    pub tools: Vec<ToolInfo>,
    pub features: FeaturesInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub root: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturesInfo {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Wire form of a tool registry entry, as returned by `tools.list` and the
/// hello payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub tier: Tier,
    pub requires_approval: bool,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// `tool` event payload; a start/result pair shares one `toolCallId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEventPayload {
    pub phase: ToolPhase,
    pub tool_call_id: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Start,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
}

/// What kind of side effect a pending approval is gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    Write,
    Exec,
    Patch,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalKind::Write => write!(f, "write"),
            ApprovalKind::Exec => write!(f, "exec"),
            ApprovalKind::Patch => write!(f, "patch"),
        }
    }
}

/// Wire form of a pending approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalInfo {
    pub id: String,
    pub kind: ApprovalKind,
    pub description: String,
    pub details: Value,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub timeout_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalsResolveParams {
    pub id: String,
    pub approve: bool,
}
