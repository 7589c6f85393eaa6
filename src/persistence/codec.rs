//! Record layout of a message inside a queue tree.
//!
//! Every message is stored as a group of entries sharing the `{id}` prefix:
//!
//! | key                  | value                                  |
//! |----------------------|----------------------------------------|
//! | `{id}`               | payload bytes                          |
//! | `{id}/headers`       | header map, see below                  |
//! | `{id}/sent`          | `i64` BE nanoseconds since Unix epoch  |
//! | `{id}/subqueue`      | sub-queue name (optional)              |
//! | `{id}/destination`   | outgoing only: endpoint + queue        |
//! | `{id}/max_attempts`  | outgoing only: `u32` BE (optional)     |
//! | `{id}/deliver_by`    | outgoing only: timestamp (optional)    |
//!
//! Header blobs start with a format version byte (currently `1`) followed by a
//! `u32` BE pair count and, for each pair in key order, a `u32` BE length and
//! the UTF-8 bytes of the key, then the same for the value. Destinations use the
//! same version byte followed by two length-prefixed strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::message::{Destination, Message, OutgoingMessage};
use crate::utils::{QueueError, Result};

pub const HEADERS: &str = "headers";
pub const SENT: &str = "sent";
pub const SUB_QUEUE: &str = "subqueue";
pub const DESTINATION: &str = "destination";
pub const MAX_ATTEMPTS: &str = "max_attempts";
pub const DELIVER_BY: &str = "deliver_by";

const FORMAT_VERSION: u8 = 1;

/// Key/value pairs ready to be written into a tree.
pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

pub fn payload_key(id: &Uuid) -> Vec<u8> {
    id.to_string().into_bytes()
}

pub fn entry_key(id: &Uuid, field: &str) -> Vec<u8> {
    format!("{id}/{field}").into_bytes()
}

/// Returns the message id if `key` is a payload key.
pub fn parse_payload_key(key: &[u8]) -> Option<Uuid> {
    if key.contains(&b'/') {
        return None;
    }
    std::str::from_utf8(key).ok()?.parse().ok()
}

/// Every key a message with `id` may occupy.
pub fn all_keys(id: &Uuid) -> Vec<Vec<u8>> {
    let mut keys = vec![payload_key(id)];
    for field in [HEADERS, SENT, SUB_QUEUE, DESTINATION, MAX_ATTEMPTS, DELIVER_BY] {
        keys.push(entry_key(id, field));
    }
    keys
}

pub fn encode_headers(headers: &HashMap<String, String>) -> Vec<u8> {
    let mut pairs: Vec<_> = headers.iter().collect();
    pairs.sort();

    let mut buf = vec![FORMAT_VERSION];
    buf.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    for (key, value) in pairs {
        put_str(&mut buf, key);
        put_str(&mut buf, value);
    }
    buf
}

pub fn decode_headers(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::versioned(bytes, "headers")?;
    let count = reader.u32()?;
    let mut headers = HashMap::new();
    for _ in 0..count {
        let key = reader.string()?;
        let value = reader.string()?;
        if headers.insert(key.clone(), value).is_some() {
            return Err(QueueError::Codec(format!("duplicate header key {key:?}")));
        }
    }
    reader.finish()?;
    Ok(headers)
}

pub fn encode_timestamp(at: DateTime<Utc>) -> Result<[u8; 8]> {
    at.timestamp_nanos_opt()
        .map(i64::to_be_bytes)
        .ok_or_else(|| QueueError::Codec(format!("timestamp {at} out of range")))
}

pub fn decode_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        QueueError::Codec(format!("timestamp must be 8 bytes, got {}", bytes.len()))
    })?;
    Ok(DateTime::from_timestamp_nanos(i64::from_be_bytes(raw)))
}

pub fn encode_destination(destination: &Destination) -> Vec<u8> {
    let mut buf = vec![FORMAT_VERSION];
    put_str(&mut buf, &destination.endpoint);
    put_str(&mut buf, &destination.queue);
    buf
}

pub fn decode_destination(bytes: &[u8]) -> Result<Destination> {
    let mut reader = Reader::versioned(bytes, "destination")?;
    let endpoint = reader.string()?;
    let queue = reader.string()?;
    reader.finish()?;
    Ok(Destination { endpoint, queue })
}

/// Entries for a message stored in its queue.
pub fn encode_message(message: &Message) -> Result<Entries> {
    let id = &message.id;
    let mut entries = vec![
        (payload_key(id), message.payload.clone()),
        (entry_key(id, HEADERS), encode_headers(&message.headers)),
        (entry_key(id, SENT), encode_timestamp(message.sent_at)?.to_vec()),
    ];
    if let Some(sub_queue) = &message.sub_queue {
        entries.push((entry_key(id, SUB_QUEUE), sub_queue.as_bytes().to_vec()));
    }
    Ok(entries)
}

/// Entries for an outgoing message: the plain record plus delivery policy.
pub fn encode_outgoing(outgoing: &OutgoingMessage) -> Result<Entries> {
    let id = &outgoing.message.id;
    let mut entries = encode_message(&outgoing.message)?;
    entries.push((
        entry_key(id, DESTINATION),
        encode_destination(&outgoing.destination),
    ));
    if let Some(max) = outgoing.max_attempts {
        entries.push((entry_key(id, MAX_ATTEMPTS), max.to_be_bytes().to_vec()));
    }
    if let Some(deliver_by) = outgoing.deliver_by {
        entries.push((
            entry_key(id, DELIVER_BY),
            encode_timestamp(deliver_by)?.to_vec(),
        ));
    }
    Ok(entries)
}

/// Rebuilds the message `id` of `queue` through `lookup`.
///
/// Returns `Ok(None)` when no payload entry exists. A payload without its
/// headers or sent entries is a corrupt record.
pub fn decode_message<F>(queue: &str, id: Uuid, lookup: F) -> Result<Option<Message>>
where
    F: Fn(&[u8]) -> Result<Option<Vec<u8>>>,
{
    let Some(payload) = lookup(&payload_key(&id))? else {
        return Ok(None);
    };
    let headers = lookup(&entry_key(&id, HEADERS))?
        .ok_or_else(|| QueueError::Codec(format!("message {id} has no headers entry")))?;
    let sent = lookup(&entry_key(&id, SENT))?
        .ok_or_else(|| QueueError::Codec(format!("message {id} has no sent entry")))?;
    let sub_queue = lookup(&entry_key(&id, SUB_QUEUE))?
        .map(|raw| {
            String::from_utf8(raw)
                .map_err(|_| QueueError::Codec(format!("message {id} has a non-UTF-8 sub-queue")))
        })
        .transpose()?;

    Ok(Some(Message {
        id,
        queue: queue.to_string(),
        payload,
        headers: decode_headers(&headers)?,
        sent_at: decode_timestamp(&sent)?,
        sub_queue,
    }))
}

/// Rebuilds an outgoing message through `lookup`.
pub fn decode_outgoing<F>(id: Uuid, lookup: F) -> Result<Option<OutgoingMessage>>
where
    F: Fn(&[u8]) -> Result<Option<Vec<u8>>>,
{
    let Some(raw_destination) = lookup(&entry_key(&id, DESTINATION))? else {
        return Ok(None);
    };
    let destination = decode_destination(&raw_destination)?;
    let Some(message) = decode_message(&destination.queue, id, &lookup)? else {
        return Ok(None);
    };
    let max_attempts = lookup(&entry_key(&id, MAX_ATTEMPTS))?
        .map(|raw| {
            <[u8; 4]>::try_from(raw.as_slice())
                .map(u32::from_be_bytes)
                .map_err(|_| QueueError::Codec(format!("message {id} has a bad max_attempts")))
        })
        .transpose()?;
    let deliver_by = lookup(&entry_key(&id, DELIVER_BY))?
        .map(|raw| decode_timestamp(&raw))
        .transpose()?;

    Ok(Some(OutgoingMessage {
        message,
        destination,
        max_attempts,
        deliver_by,
    }))
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn versioned(bytes: &'a [u8], what: &'static str) -> Result<Self> {
        let mut reader = Self {
            bytes,
            pos: 0,
            what,
        };
        let version = reader.take(1)?[0];
        if version != FORMAT_VERSION {
            return Err(QueueError::Codec(format!(
                "unknown {what} format version {version}"
            )));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| QueueError::Codec(format!("truncated {} blob", self.what)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| QueueError::Codec(format!("non-UTF-8 string in {} blob", self.what)))
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(QueueError::Codec(format!(
                "{} trailing bytes in {} blob",
                self.bytes.len() - self.pos,
                self.what
            )));
        }
        Ok(())
    }
}
