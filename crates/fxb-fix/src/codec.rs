//! FIX wire codec: tag=value pairs separated by SOH, framed by
//! BeginString/BodyLength and a trailing modulo-256 checksum.

use crate::error::{FixError, FixResult};
use crate::fields::{tag, BEGIN_STRING, SOH};
use std::fmt;

/// A decoded frame: fields in wire order, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    fields: Vec<(u32, String)>,
}

impl RawMessage {
    pub fn new(fields: Vec<(u32, String)>) -> Self {
        Self { fields }
    }

    /// First value for a tag. Repeating-group members can appear more than
    /// once; use `fields()` to walk groups in wire order.
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, tag: u32) -> FixResult<&str> {
        self.get(tag).ok_or(FixError::MissingTag(tag))
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, tag: u32) -> FixResult<T> {
        let raw = self.require(tag)?;
        raw.parse().map_err(|_| FixError::InvalidValue {
            tag,
            value: raw.to_string(),
        })
    }

    pub fn fields(&self) -> &[(u32, String)] {
        &self.fields
    }

    pub fn msg_type(&self) -> FixResult<&str> {
        self.require(tag::MSG_TYPE)
    }

    pub fn seq_num(&self) -> FixResult<u64> {
        self.get_parsed(tag::MSG_SEQ_NUM)
    }

    pub fn poss_dup(&self) -> bool {
        self.get(tag::POSS_DUP_FLAG) == Some("Y")
    }

    /// Body fields: everything that is not standard header or trailer.
    /// Used when re-emitting a journaled message during resend.
    pub fn body_fields(&self) -> Vec<(u32, String)> {
        self.fields
            .iter()
            .filter(|(t, _)| {
                !matches!(
                    *t,
                    tag::BEGIN_STRING
                        | tag::BODY_LENGTH
                        | tag::MSG_TYPE
                        | tag::MSG_SEQ_NUM
                        | tag::SENDER_COMP_ID
                        | tag::TARGET_COMP_ID
                        | tag::SENDING_TIME
                        | tag::CHECK_SUM
                )
            })
            .cloned()
            .collect()
    }
}

impl fmt::Display for RawMessage {
    /// Render with `|` in place of SOH for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (t, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{t}={v}")?;
        }
        Ok(())
    }
}

/// Sum of all bytes modulo 256.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().map(|&b| b as u32).sum::<u32>() % 256
}

/// FIX timestamp (UTC, millisecond precision) for tag 52.
pub fn sending_time() -> String {
    chrono::Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

/// Encode one message.
///
/// `header` supplies MsgType/SeqNum/CompIDs/SendingTime; `body` is the
/// application payload in wire order. BeginString, BodyLength and CheckSum
/// are computed here and must not be passed in.
pub fn encode_message(
    msg_type: &str,
    seq_num: u64,
    sender_comp_id: &str,
    target_comp_id: &str,
    body: &[(u32, String)],
) -> Vec<u8> {
    let mut content = Vec::with_capacity(128);
    push_field(&mut content, tag::MSG_TYPE, msg_type);
    push_field(&mut content, tag::SENDER_COMP_ID, sender_comp_id);
    push_field(&mut content, tag::TARGET_COMP_ID, target_comp_id);
    push_field(&mut content, tag::MSG_SEQ_NUM, &seq_num.to_string());
    push_field(&mut content, tag::SENDING_TIME, &sending_time());
    for (t, v) in body {
        push_field(&mut content, *t, v);
    }

    let mut message = Vec::with_capacity(content.len() + 32);
    push_field(&mut message, tag::BEGIN_STRING, BEGIN_STRING);
    push_field(&mut message, tag::BODY_LENGTH, &content.len().to_string());
    message.extend_from_slice(&content);

    let cks = checksum(&message);
    push_field(&mut message, tag::CHECK_SUM, &format!("{cks:03}"));
    message
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

/// Incremental frame decoder.
///
/// Feed raw socket bytes in; complete, checksum-verified frames come out.
/// Malformed input surfaces as an error so the session can reset.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, None until more bytes arrive.
    pub fn next_frame(&mut self) -> FixResult<Option<RawMessage>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let prefix = format!("8={BEGIN_STRING}\x019=");
        if self.buf.len() < prefix.len() {
            return Ok(None);
        }
        if !self.buf.starts_with(prefix.as_bytes()) {
            return Err(FixError::Malformed(
                "frame does not start with BeginString".to_string(),
            ));
        }

        // Locate the SOH terminating BodyLength.
        let len_start = prefix.len();
        let Some(len_end_rel) = self.buf[len_start..].iter().position(|&b| b == SOH) else {
            return Ok(None);
        };
        let len_end = len_start + len_end_rel;
        let body_len: usize = std::str::from_utf8(&self.buf[len_start..len_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FixError::Malformed("unparsable BodyLength".to_string()))?;

        // header .. SOH, body, then "10=NNN" SOH (7 bytes).
        let body_start = len_end + 1;
        let trailer_start = body_start + body_len;
        let total = trailer_start + 7;
        if self.buf.len() < total {
            return Ok(None);
        }

        let trailer = &self.buf[trailer_start..total];
        if !trailer.starts_with(b"10=") || trailer[6] != SOH {
            return Err(FixError::Malformed("bad checksum trailer".to_string()));
        }
        let declared = std::str::from_utf8(&trailer[3..6])
            .map_err(|_| FixError::Malformed("non-utf8 checksum".to_string()))?
            .to_string();
        let computed = checksum(&self.buf[..trailer_start]);
        if declared.parse::<u32>().ok() != Some(computed) {
            self.buf.clear();
            return Err(FixError::Checksum { declared, computed });
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let message = parse_fields(&frame)?;
        Ok(Some(message))
    }
}

fn parse_fields(frame: &[u8]) -> FixResult<RawMessage> {
    let mut fields = Vec::new();
    for part in frame.split(|&b| b == SOH) {
        if part.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(part)
            .map_err(|_| FixError::Malformed("non-utf8 field".to_string()))?;
        let (tag_str, value) = text
            .split_once('=')
            .ok_or_else(|| FixError::Malformed(format!("field without '=': {text}")))?;
        let tag: u32 = tag_str
            .parse()
            .map_err(|_| FixError::Malformed(format!("non-numeric tag: {tag_str}")))?;
        fields.push((tag, value.to_string()));
    }
    Ok(RawMessage::new(fields))
}
