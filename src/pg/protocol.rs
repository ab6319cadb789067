//! Protocol v3 message framing.
//!
//! Frontend messages encode themselves into a complete frame. Backend frames
//! decode into [`BackendMessage`], rejecting bodies shorter than they claim.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

/// Version 3.0 as sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Stands in for the protocol version in a CancelRequest packet.
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678;

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => Format::Text,
            _ => Format::Binary,
        }
    }
}

/// Server transaction state carried by every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: outside a transaction block
    Idle,
    /// `T`: inside a transaction block
    Active,
    /// `E`: inside a failed block; only ROLLBACK is accepted
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::Active,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend messages
// ============================================================================

/// A client message that encodes into one complete frame.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// First packet on a new connection: protocol version and session parameters.
///
/// Untyped, so the length prefix comes first and counts itself.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut params = BytesMut::new();
        let mut put_param = |key: &str, value: &str| {
            params.put_slice(key.as_bytes());
            params.put_u8(0);
            params.put_slice(value.as_bytes());
            params.put_u8(0);
        };

        put_param("user", &self.user);
        if let Some(db) = &self.database {
            put_param("database", db);
        }
        for (key, value) in &self.options {
            put_param(key, value);
        }
        params.put_u8(0);

        let mut buf = BytesMut::with_capacity(params.len() + 8);
        buf.put_i32(params.len() as i32 + 8);
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_slice(&params);
        buf
    }
}

/// Answer to a cleartext or MD5 challenge; `password` is already hashed for MD5.
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.password.len() + 1);
        put_cstr(&mut body, &self.password);
        typed(b'p', &body)
    }
}

/// Frame `body` as a typed message: tag byte, then a length that counts itself.
fn typed(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn put_cstr(body: &mut BytesMut, s: &str) {
    body.put_slice(s.as_bytes());
    body.put_u8(0);
}

/// Simple query ('Q'); may hold several `;`-separated statements.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.query.len() + 1);
        put_cstr(&mut body, &self.query);
        typed(b'Q', &body)
    }
}

/// Parse ('P'): names a server-side statement. An empty name is the unnamed statement.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstr(&mut body, &self.name);
        put_cstr(&mut body, &self.query);
        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_i32(oid.as_i32());
        }
        typed(b'P', &body)
    }
}

/// Bind ('B'): attaches encoded parameters to a statement, producing a portal.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// Already-encoded parameter values, `None` for NULL
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

fn put_formats(body: &mut BytesMut, formats: &[Format]) {
    body.put_i16(formats.len() as i16);
    for format in formats {
        body.put_i16(*format as i16);
    }
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstr(&mut body, &self.portal);
        put_cstr(&mut body, &self.statement);
        put_formats(&mut body, &self.param_formats);

        body.put_i16(self.params.len() as i16);
        for param in &self.params {
            match param {
                Some(encoded) => {
                    body.put_i32(encoded.len() as i32);
                    body.put_slice(encoded);
                }
                None => body.put_i32(-1),
            }
        }

        put_formats(&mut body, &self.result_formats);
        typed(b'B', &body)
    }
}

/// Execute ('E'): runs a bound portal for at most `max_rows` rows, 0 meaning all.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.portal.len() + 5);
        put_cstr(&mut body, &self.portal);
        body.put_i32(self.max_rows);
        typed(b'E', &body)
    }
}

/// Describe ('D') of a statement (`kind` b'S') or portal (b'P').
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.name.len() + 2);
        body.put_u8(self.kind);
        put_cstr(&mut body, &self.name);
        typed(b'D', &body)
    }
}

/// Sync ('S'): ends an extended-query cycle and asks for ReadyForQuery.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        typed(b'S', &[])
    }
}

/// Flush ('H'): asks for pending replies without ending the cycle.
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        typed(b'H', &[])
    }
}

/// Terminate ('X'): polite goodbye before the socket closes.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        typed(b'X', &[])
    }
}

/// Close ('C') of a statement (`kind` b'S') or portal (b'P').
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.name.len() + 2);
        body.put_u8(self.kind);
        put_cstr(&mut body, &self.name);
        typed(b'C', &body)
    }
}

/// CancelRequest: sent alone on a fresh connection to interrupt a running command.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
        buf
    }
}

// ============================================================================
// Backend messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// A NoticeResponse, surfaced to callers as a command warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl Notice {
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
        }
    }
}

/// A decoded server message.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Startup and authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    /// Any other authentication request (SASL, GSS, SSPI, ...)
    AuthenticationUnsupported {
        code: i32,
    },

    // Results
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended-query acknowledgements
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Session state
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Asynchronous and describe replies
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode one backend message starting at its type byte.
    ///
    /// A body shorter than its fields claim is a protocol error, never a panic.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();

        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(len as usize - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Self::decode_error_response(body),
            b'N' => Self::decode_notice_response(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        let auth_type = take_i32(&mut body, "Authentication")?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 if body.remaining() >= 4 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            5 => Err(PgError::Protocol("Truncated MD5 salt".to_string())),
            code => Ok(BackendMessage::AuthenticationUnsupported { code }),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        // name terminator plus 18 bytes of fixed attributes per field
        let num_fields = take_count(&mut body, 19, "RowDescription")?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            if body.remaining() < 18 {
                return Err(truncated("RowDescription"));
            }
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: Format::from_i16(body.get_i16()),
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        let num_cols = take_count(&mut body, 4, "DataRow")?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = take_i32(&mut body, "DataRow")?;
            if len < 0 {
                values.push(None);
            } else if len as usize > body.remaining() {
                return Err(PgError::Protocol(format!(
                    "DataRow value of {} bytes exceeds message body",
                    len
                )));
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        if !body.has_remaining() {
            return Err(truncated("ReadyForQuery"));
        }
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_error_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::ErrorResponse { fields })
    }

    fn decode_notice_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::NoticeResponse { fields })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        let process_id = take_i32(&mut body, "BackendKeyData")?;
        let secret_key = take_i32(&mut body, "BackendKeyData")?;
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        let num_params = take_count(&mut body, 4, "ParameterDescription")?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_i32(body.get_i32()))
            .collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        let process_id = take_i32(&mut body, "NotificationResponse")?;
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Body readers
// ============================================================================

fn truncated(message: &str) -> PgError {
    PgError::Protocol(format!("Truncated {} message", message))
}

fn take_i32(body: &mut Bytes, message: &str) -> PgResult<i32> {
    if body.remaining() < 4 {
        return Err(truncated(message));
    }
    Ok(body.get_i32())
}

/// Read an Int16 item count and check that `min_item_size` bytes per item remain.
fn take_count(body: &mut Bytes, min_item_size: usize, message: &str) -> PgResult<usize> {
    if body.remaining() < 2 {
        return Err(truncated(message));
    }
    let count = body.get_i16();
    if count < 0 || count as usize * min_item_size > body.remaining() {
        return Err(PgError::Protocol(format!(
            "{} claims {} items in {} bytes",
            message,
            count,
            body.remaining()
        )));
    }
    Ok(count as usize)
}

/// Read a NUL-terminated string; invalid UTF-8 is replaced rather than rejected.
pub(crate) fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(&buf[..end]).into_owned(),
    };

    buf.advance(end + 1);
    Ok(s)
}

/// Collect the tagged fields of an ErrorResponse or NoticeResponse.
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(&mut body)?);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_packet_carries_parameters() {
        let msg = StartupMessage {
            user: "app".to_string(),
            database: Some("orders".to_string()),
            options: vec![("application_name".to_string(), "batch".to_string())],
        };

        let encoded = msg.encode();

        let len = i32::from_be_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(len as usize, encoded.len());
        assert_eq!(i32::from_be_bytes(encoded[4..8].try_into().unwrap()), PROTOCOL_VERSION);
        assert_eq!(
            &encoded[8..],
            &b"user\0app\0database\0orders\0application_name\0batch\0\0"[..]
        );
    }

    #[test]
    fn test_password_frame() {
        let encoded = PasswordMessage { password: "md5abc".to_string() }.encode();
        assert_eq!(&encoded[..], &b"p\0\0\0\x0bmd5abc\0"[..]);
    }

    #[test]
    fn test_query_message_structure() {
        let msg = QueryMessage {
            query: "SELECT 1".to_string(),
        };

        let encoded = msg.encode();

        assert_eq!(encoded[0], b'Q');

        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1); // -1 for message type
    }

    #[test]
    fn test_close_message_structure() {
        let msg = CloseMessage {
            kind: b'S',
            name: "1f".to_string(),
        };

        let encoded = msg.encode();

        assert_eq!(encoded[0], b'C');
        assert_eq!(encoded[5], b'S');
        assert_eq!(&encoded[6..8], b"1f");
        assert_eq!(*encoded.last().unwrap(), 0);
    }

    #[test]
    fn test_cancel_request_layout() {
        let msg = CancelRequestMessage {
            process_id: 4242,
            secret_key: -7,
        };

        let encoded = msg.encode();

        assert_eq!(encoded.len(), 16);
        assert_eq!(i32::from_be_bytes(encoded[4..8].try_into().unwrap()), CANCEL_REQUEST_CODE);
        assert_eq!(i32::from_be_bytes(encoded[8..12].try_into().unwrap()), 4242);
        assert_eq!(i32::from_be_bytes(encoded[12..16].try_into().unwrap()), -7);
    }

    #[test]
    fn test_bind_null_parameter() {
        let msg = BindMessage {
            portal: String::new(),
            statement: String::new(),
            param_formats: vec![Format::Binary],
            params: vec![None],
            result_formats: vec![],
        };

        let encoded = msg.encode();
        // 'B' len portal\0 stmt\0 nfmt fmt nparams len(-1) nresult
        let tail = &encoded[encoded.len() - 6..];
        assert_eq!(&tail[..4], &(-1i32).to_be_bytes());
        assert_eq!(&tail[4..], &0i16.to_be_bytes());
    }

    #[test]
    fn test_unsupported_auth_is_not_an_error() {
        let data: &[u8] = &[b'R', 0, 0, 0, 8, 0, 0, 0, 10];
        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(data)).unwrap();
        assert!(matches!(
            msg,
            BackendMessage::AuthenticationUnsupported { code: 10 }
        ));
    }
}
