//! Emissary wire framing.
//!
//! All frames are ASCII. The first client frame is at most 256 bytes and is
//! trimmed of trailing NULs before parsing. The request type is the first 7
//! bytes; the service id, when present, is the 3-byte zero-padded decimal
//! field at offset 8.

use crate::error::{DrawbridgeError, DrawbridgeResult};

/// Maximum size of the first client frame.
pub const MAX_FRAME_LEN: usize = 256;

/// Length of the request-type field.
const TYPE_LEN: usize = 7;

/// Offset of the 3-digit service id field.
const ID_OFFSET: usize = 8;

/// Length of the service id field.
const ID_LEN: usize = 3;

/// Offset of the service name in an `OB_CR8T` frame (type + space + ignored
/// id field + space).
const NAME_OFFSET: usize = ID_OFFSET + ID_LEN + 1;

/// Acknowledgement sent after a successful outbound registration.
pub const ACK: &[u8] = b"ACK";

/// Prefix of the service-list reply.
pub const LIST_PREFIX: &str = "PS_LIST: ";

/// Request type tags, as recorded in per-request events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    List,
    Connect,
    RegisterOutbound,
}

impl RequestKind {
    /// The wire spelling of the request type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::List => "PS_LIST",
            RequestKind::Connect => "PS_CONN",
            RequestKind::RegisterOutbound => "OB_CR8T",
        }
    }
}

/// A parsed first frame from an Emissary client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `PS_LIST` — request the list of accessible services.
    ListServices,
    /// `PS_CONN nnn` — open a session to service `nnn`.
    Connect { service_id: u16 },
    /// `OB_CR8T nnn name` — register this connection as an outbound service.
    /// The id field is ignored; the server allocates outbound ids itself.
    RegisterOutbound { name: String },
}

impl Frame {
    /// The request kind of this frame.
    pub fn kind(&self) -> RequestKind {
        match self {
            Frame::ListServices => RequestKind::List,
            Frame::Connect { .. } => RequestKind::Connect,
            Frame::RegisterOutbound { .. } => RequestKind::RegisterOutbound,
        }
    }

    /// Parse the first client frame.
    ///
    /// Trailing NUL bytes are trimmed first (clients read into fixed
    /// buffers). Unknown types, short frames, and malformed fields are all
    /// protocol failures; the caller closes the connection without a
    /// response.
    pub fn parse(buf: &[u8]) -> DrawbridgeResult<Frame> {
        let buf = trim_trailing_nuls(buf);
        if buf.len() > MAX_FRAME_LEN {
            return Err(DrawbridgeError::Protocol(format!(
                "frame exceeds {MAX_FRAME_LEN} bytes"
            )));
        }
        if buf.len() < TYPE_LEN {
            return Err(DrawbridgeError::Protocol("frame too short".into()));
        }

        match &buf[..TYPE_LEN] {
            b"PS_LIST" => Ok(Frame::ListServices),
            b"PS_CONN" => {
                let service_id = parse_service_id(buf)?;
                Ok(Frame::Connect { service_id })
            }
            b"OB_CR8T" => {
                // The id field must still be present, but its value is ignored.
                parse_service_id(buf)?;
                let name = parse_service_name(buf)?;
                Ok(Frame::RegisterOutbound { name })
            }
            other => Err(DrawbridgeError::Protocol(format!(
                "unknown request type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Format the `PS_LIST` reply for an ordered `(id, name)` snapshot.
    ///
    /// Each entry becomes a comma-terminated `NNNname` token; the reply ends
    /// with a newline: `PS_LIST: 001web,002db,\n`.
    pub fn encode_list<'a, I>(entries: I) -> String
    where
        I: IntoIterator<Item = (u16, &'a str)>,
    {
        let mut out = String::from(LIST_PREFIX);
        for (id, name) in entries {
            out.push_str(&format!("{id:03}{name},"));
        }
        out.push('\n');
        out
    }
}

/// Check that an outbound service name is representable in the list reply.
///
/// Tokens in the reply are `NNNname` terminated by a comma, so commas and
/// control characters cannot appear in a name.
pub fn validate_service_name(name: &str) -> DrawbridgeResult<()> {
    if name.is_empty() {
        return Err(DrawbridgeError::Protocol("empty service name".into()));
    }
    if name.chars().any(|c| c == ',' || c.is_control()) {
        return Err(DrawbridgeError::Protocol(format!(
            "invalid service name {name:?}"
        )));
    }
    Ok(())
}

fn trim_trailing_nuls(buf: &[u8]) -> &[u8] {
    let end = buf.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &buf[..end]
}

fn parse_service_id(buf: &[u8]) -> DrawbridgeResult<u16> {
    let field = buf
        .get(ID_OFFSET..ID_OFFSET + ID_LEN)
        .ok_or_else(|| DrawbridgeError::Protocol("missing service id field".into()))?;
    if buf.get(TYPE_LEN) != Some(&b' ') {
        return Err(DrawbridgeError::Protocol("missing separator".into()));
    }
    let text = std::str::from_utf8(field)
        .map_err(|_| DrawbridgeError::Protocol("service id is not ASCII".into()))?;
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DrawbridgeError::Protocol(format!(
            "service id {text:?} is not 3 decimal digits"
        )));
    }
    text.parse::<u16>()
        .map_err(|_| DrawbridgeError::Protocol(format!("bad service id {text:?}")))
}

fn parse_service_name(buf: &[u8]) -> DrawbridgeResult<String> {
    let rest = buf
        .get(NAME_OFFSET..)
        .ok_or_else(|| DrawbridgeError::Protocol("missing service name".into()))?;
    let name = std::str::from_utf8(rest)
        .map_err(|_| DrawbridgeError::Protocol("service name is not UTF-8".into()))?
        .trim()
        .to_string();
    validate_service_name(&name)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_request() {
        assert_eq!(Frame::parse(b"PS_LIST").unwrap(), Frame::ListServices);
    }

    #[test]
    fn parses_list_request_with_nul_padding() {
        let mut buf = vec![0u8; 256];
        buf[..7].copy_from_slice(b"PS_LIST");
        assert_eq!(Frame::parse(&buf).unwrap(), Frame::ListServices);
    }

    #[test]
    fn parses_connect_request() {
        assert_eq!(
            Frame::parse(b"PS_CONN 002").unwrap(),
            Frame::Connect { service_id: 2 }
        );
        assert_eq!(
            Frame::parse(b"PS_CONN 999").unwrap(),
            Frame::Connect { service_id: 999 }
        );
    }

    #[test]
    fn rejects_connect_with_bad_id() {
        assert!(Frame::parse(b"PS_CONN ab3").is_err());
        assert!(Frame::parse(b"PS_CONN 12").is_err());
        assert!(Frame::parse(b"PS_CONN").is_err());
    }

    #[test]
    fn parses_outbound_registration() {
        assert_eq!(
            Frame::parse(b"OB_CR8T 999 mc").unwrap(),
            Frame::RegisterOutbound { name: "mc".into() }
        );
    }

    #[test]
    fn outbound_name_is_whitespace_trimmed() {
        assert_eq!(
            Frame::parse(b"OB_CR8T 999       minecraft\n").unwrap(),
            Frame::RegisterOutbound {
                name: "minecraft".into()
            }
        );
    }

    #[test]
    fn rejects_outbound_without_name() {
        assert!(Frame::parse(b"OB_CR8T 999 ").is_err());
        assert!(Frame::parse(b"OB_CR8T 999").is_err());
    }

    #[test]
    fn rejects_outbound_name_with_comma() {
        assert!(Frame::parse(b"OB_CR8T 999 a,b").is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(Frame::parse(b"GET / HTTP/1.1").is_err());
        assert!(Frame::parse(b"PS_").is_err());
        assert!(Frame::parse(b"").is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let buf = vec![b'A'; MAX_FRAME_LEN + 1];
        assert!(Frame::parse(&buf).is_err());
    }

    #[test]
    fn list_reply_format() {
        let reply = Frame::encode_list([(1, "web"), (2, "db")]);
        assert_eq!(reply, "PS_LIST: 001web,002db,\n");
    }

    #[test]
    fn list_reply_empty() {
        assert_eq!(
            Frame::encode_list(Vec::<(u16, &str)>::new()),
            "PS_LIST: \n"
        );
    }

    #[test]
    fn list_reply_pads_ids() {
        let reply = Frame::encode_list([(7, "a"), (42, "b"), (999, "mc")]);
        assert_eq!(reply, "PS_LIST: 007a,042b,999mc,\n");
    }
}
