//! Recon protocol messages and their length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes:
//! one message type byte, then the message body in the primitive encodings
//! of [`crate::wire`].  The config handshake additionally exchanges bare,
//! unframed strings (`passed`/`failed` plus a reason).

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use num_bigint::BigUint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bitstring::Bitstring;
use crate::error::WireError;
use crate::field::Zp;
use crate::wire::{
    read_bitstring, read_int, read_len, read_string, read_zset, read_zz_array, write_bitstring,
    write_int, write_len, write_string, write_zset, write_zz_array, MAX_READ_LEN,
};
use crate::zset::ZSet;

/// Config acknowledgement sent when the remote configuration is acceptable.
pub const CONFIG_PASSED: &str = "passed";
/// Config acknowledgement sent when the remote configuration is rejected.
pub const CONFIG_FAILED: &str = "failed";

/// Wire tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Sample values of a node.
    ReconRqstPoly = 0,
    /// Full element list of a small node.
    ReconRqstFull = 1,
    /// Elements the receiver is missing.
    Elements = 2,
    /// Full element list sent back when interpolation failed.
    FullElements = 3,
    /// Interpolation failed; descend.
    SyncFail = 4,
    /// Session complete.
    Done = 5,
    /// End of a request batch.
    Flush = 6,
    /// Free-form error text.
    Error = 7,
    /// Database request (not supported).
    DbRqst = 8,
    /// Database reply (not supported).
    DbRepl = 9,
    /// Peer configuration.
    Config = 10,
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            0 => MsgType::ReconRqstPoly,
            1 => MsgType::ReconRqstFull,
            2 => MsgType::Elements,
            3 => MsgType::FullElements,
            4 => MsgType::SyncFail,
            5 => MsgType::Done,
            6 => MsgType::Flush,
            7 => MsgType::Error,
            8 => MsgType::DbRqst,
            9 => MsgType::DbRepl,
            10 => MsgType::Config,
            other => return Err(WireError::UnknownMessage(other)),
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Configuration advertised by each side at the start of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Software version string.
    pub version: String,
    /// Port of the peer's HKP service, used to fetch recovered keys.
    pub http_port: u32,
    /// Key bits per tree level.
    pub bit_quantum: usize,
    /// Interpolation capacity.
    pub mbar: usize,
    /// Comma separated merge filters.
    pub filters: String,
    /// Any further key/value pairs.
    pub custom: BTreeMap<String, String>,
}

impl Config {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        write_len(w, 5 + self.custom.len())?;
        write_string(w, "version")?;
        write_string(w, &self.version)?;
        for (key, value) in [
            ("http port", self.http_port as usize),
            ("bitquantum", self.bit_quantum),
            ("mbar", self.mbar),
        ] {
            write_string(w, key)?;
            write_int(w, 4)?;
            write_len(w, value)?;
        }
        write_string(w, "filters")?;
        write_string(w, &self.filters)?;
        for (key, value) in &self.custom {
            write_string(w, key)?;
            write_string(w, value)?;
        }
        Ok(())
    }

    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        let n = read_len(r)?;
        let mut config = Config::default();
        for _ in 0..n {
            let key = read_string(r)?;
            match key.as_str() {
                "http port" | "bitquantum" | "mbar" => {
                    let width = read_len(r)?;
                    if width != 4 {
                        return Err(WireError::Malformed(format!(
                            "invalid length {width} for integer config value {key}"
                        )));
                    }
                    let value = read_int(r)?;
                    match key.as_str() {
                        "http port" => config.http_port = value,
                        "bitquantum" => config.bit_quantum = value as usize,
                        _ => config.mbar = value as usize,
                    }
                }
                "version" => config.version = read_string(r)?,
                "filters" => config.filters = read_string(r)?,
                _ => {
                    let value = read_string(r)?;
                    config.custom.insert(key, value);
                }
            }
        }
        Ok(config)
    }
}

/// A recon protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconMsg {
    /// Sample values and size of the node at `prefix`.
    ReconRqstPoly {
        /// Node key.
        prefix: Bitstring,
        /// Element count under the node.
        size: usize,
        /// Aggregate sample values.
        samples: Vec<Zp>,
    },
    /// Every element under the node at `prefix`.
    ReconRqstFull {
        /// Node key.
        prefix: Bitstring,
        /// The node's elements.
        elements: ZSet,
    },
    /// Elements the receiver lacks.
    Elements(ZSet),
    /// All local elements under the requested node.
    FullElements(ZSet),
    /// Interpolation failed at this node.
    SyncFail,
    /// The responder has finished the walk.
    Done,
    /// End of a batch of requests.
    Flush,
    /// Error text; the session ends.
    Error(String),
    /// Database request.
    DbRqst(String),
    /// Database reply.
    DbRepl(String),
    /// Configuration handshake.
    Config(Config),
}

impl ReconMsg {
    /// Wire tag of this message.
    pub fn msg_type(&self) -> MsgType {
        match self {
            ReconMsg::ReconRqstPoly { .. } => MsgType::ReconRqstPoly,
            ReconMsg::ReconRqstFull { .. } => MsgType::ReconRqstFull,
            ReconMsg::Elements(_) => MsgType::Elements,
            ReconMsg::FullElements(_) => MsgType::FullElements,
            ReconMsg::SyncFail => MsgType::SyncFail,
            ReconMsg::Done => MsgType::Done,
            ReconMsg::Flush => MsgType::Flush,
            ReconMsg::Error(_) => MsgType::Error,
            ReconMsg::DbRqst(_) => MsgType::DbRqst,
            ReconMsg::DbRepl(_) => MsgType::DbRepl,
            ReconMsg::Config(_) => MsgType::Config,
        }
    }

    /// Encodes type byte and body, without the frame length.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = vec![self.msg_type() as u8];
        match self {
            ReconMsg::ReconRqstPoly {
                prefix,
                size,
                samples,
            } => {
                write_bitstring(&mut out, prefix)?;
                write_len(&mut out, *size)?;
                write_zz_array(&mut out, samples)?;
            }
            ReconMsg::ReconRqstFull { prefix, elements } => {
                write_bitstring(&mut out, prefix)?;
                write_zset(&mut out, elements)?;
            }
            ReconMsg::Elements(set) | ReconMsg::FullElements(set) => write_zset(&mut out, set)?,
            ReconMsg::SyncFail | ReconMsg::Done | ReconMsg::Flush => {}
            ReconMsg::Error(text) | ReconMsg::DbRqst(text) | ReconMsg::DbRepl(text) => {
                write_string(&mut out, text)?
            }
            ReconMsg::Config(config) => config.encode(&mut out)?,
        }
        Ok(out)
    }

    /// Decodes a frame body; elements belong to the field `p`.
    pub fn decode(body: &[u8], p: &Arc<BigUint>) -> Result<Self, WireError> {
        let mut r = Cursor::new(body);
        let mut tag = [0u8; 1];
        Read::read_exact(&mut r, &mut tag)?;
        Ok(match MsgType::try_from(tag[0])? {
            MsgType::ReconRqstPoly => ReconMsg::ReconRqstPoly {
                prefix: read_bitstring(&mut r)?,
                size: read_len(&mut r)?,
                samples: read_zz_array(&mut r, p)?,
            },
            MsgType::ReconRqstFull => ReconMsg::ReconRqstFull {
                prefix: read_bitstring(&mut r)?,
                elements: read_zset(&mut r, p)?,
            },
            MsgType::Elements => ReconMsg::Elements(read_zset(&mut r, p)?),
            MsgType::FullElements => ReconMsg::FullElements(read_zset(&mut r, p)?),
            MsgType::SyncFail => ReconMsg::SyncFail,
            MsgType::Done => ReconMsg::Done,
            MsgType::Flush => ReconMsg::Flush,
            MsgType::Error => ReconMsg::Error(read_string(&mut r)?),
            MsgType::DbRqst => ReconMsg::DbRqst(read_string(&mut r)?),
            MsgType::DbRepl => ReconMsg::DbRepl(read_string(&mut r)?),
            MsgType::Config => ReconMsg::Config(Config::decode(&mut r)?),
        })
    }
}

impl fmt::Display for ReconMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconMsg::ReconRqstPoly { prefix, size, .. } => {
                write!(f, "ReconRqstPoly: prefix={prefix} size={size}")
            }
            ReconMsg::ReconRqstFull { prefix, elements } => {
                write!(f, "ReconRqstFull: prefix={prefix} ({} elements)", elements.len())
            }
            ReconMsg::Elements(set) => write!(f, "Elements ({})", set.len()),
            ReconMsg::FullElements(set) => write!(f, "FullElements ({})", set.len()),
            ReconMsg::Error(text) | ReconMsg::DbRqst(text) | ReconMsg::DbRepl(text) => {
                write!(f, "{}: {text}", self.msg_type())
            }
            ReconMsg::Config(c) => write!(
                f,
                "Config: version={} http_port={} bitquantum={} mbar={} filters={}",
                c.version, c.http_port, c.bit_quantum, c.mbar, c.filters
            ),
            other => write!(f, "{}", other.msg_type()),
        }
    }
}

/// Reads one framed message.
pub async fn read_msg<R>(r: &mut R, p: &Arc<BigUint>) -> Result<ReconMsg, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_READ_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    ReconMsg::decode(&body, p)
}

/// Writes messages as consecutive frames and flushes once.
pub async fn write_msgs<W>(w: &mut W, msgs: &[ReconMsg]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::new();
    for msg in msgs {
        let body = msg.encode()?;
        write_len(&mut out, body.len())?;
        out.extend_from_slice(&body);
    }
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a bare length-prefixed string, as used by the config handshake.
pub async fn read_raw_string<R>(r: &mut R) -> Result<String, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_READ_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| WireError::Utf8)
}

/// Writes bare length-prefixed strings and flushes.
pub async fn write_raw_strings<W>(w: &mut W, items: &[&str]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::new();
    for item in items {
        write_string(&mut out, item)?;
    }
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::p_sks;

    fn sample_config() -> Config {
        let mut custom = BTreeMap::new();
        custom.insert("foo".to_string(), "bar".to_string());
        Config {
            version: "1.1.6".into(),
            http_port: 11371,
            bit_quantum: 2,
            mbar: 5,
            filters: "yminsky.dedup,yminsky.merge".into(),
            custom,
        }
    }

    #[test]
    fn test_config_body_layout() {
        let body = ReconMsg::Config(sample_config()).encode().unwrap();
        assert_eq!(body[0], 10);
        assert_eq!(&body[1..5], &[0, 0, 0, 6]);
        // "version" key
        assert_eq!(&body[5..9], &[0, 0, 0, 7]);
        assert_eq!(&body[9..16], b"version");
        let back = ReconMsg::decode(&body, &p_sks()).unwrap();
        assert_eq!(back, ReconMsg::Config(sample_config()));
    }

    #[test]
    fn test_config_rejects_bad_int_width() {
        let mut body = vec![MsgType::Config as u8];
        write_len(&mut body, 1).unwrap();
        write_string(&mut body, "mbar").unwrap();
        write_int(&mut body, 8).unwrap();
        write_int(&mut body, 5).unwrap();
        assert!(matches!(
            ReconMsg::decode(&body, &p_sks()),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_poly_request_with_inflated_prefix_rejected() {
        let mut body = vec![MsgType::ReconRqstPoly as u8];
        write_int(&mut body, 1 << 24).unwrap();
        write_int(&mut body, 1).unwrap();
        body.push(0xff);
        write_len(&mut body, 0).unwrap();
        write_len(&mut body, 0).unwrap();
        assert!(matches!(
            ReconMsg::decode(&body, &p_sks()),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            ReconMsg::decode(&[42], &p_sks()),
            Err(WireError::UnknownMessage(42))
        ));
    }

    #[test]
    fn test_empty_messages_are_one_byte() {
        for (msg, tag) in [
            (ReconMsg::SyncFail, 4u8),
            (ReconMsg::Done, 5),
            (ReconMsg::Flush, 6),
        ] {
            assert_eq!(msg.encode().unwrap(), vec![tag]);
        }
    }

    #[tokio::test]
    async fn test_framed_stream() {
        let p = p_sks();
        let prefix = Bitstring::new(0).child(2, 1);
        let msgs = vec![
            ReconMsg::ReconRqstPoly {
                prefix: prefix.clone(),
                size: 60,
                samples: vec![Zp::from_i64(&p, 9); 6],
            },
            ReconMsg::ReconRqstFull {
                prefix,
                elements: [65537, 65539]
                    .into_iter()
                    .map(|v| Zp::from_i64(&p, v))
                    .collect(),
            },
            ReconMsg::Error("boom".into()),
            ReconMsg::Flush,
        ];
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_msgs(&mut a, &msgs).await.unwrap();
        for want in &msgs {
            assert_eq!(&read_msg(&mut b, &p).await.unwrap(), want);
        }

        write_raw_strings(&mut a, &[CONFIG_FAILED, "mismatched mbar"])
            .await
            .unwrap();
        assert_eq!(read_raw_string(&mut b).await.unwrap(), CONFIG_FAILED);
        assert_eq!(read_raw_string(&mut b).await.unwrap(), "mismatched mbar");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_READ_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_msg(&mut b, &p_sks()).await,
            Err(WireError::TooLarge(_))
        ));
    }
}
