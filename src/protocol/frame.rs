//! Frame encoding and decoding.
//!
//! Every message travels as one self-delimiting frame:
//!
//! ```text
//! +-----------+----------------------+-------------------+
//! | Tag (1 B) | Length (4 B, big-end)| Payload (N bytes) |
//! +-----------+----------------------+-------------------+
//! ```
//!
//! Payload layouts by tag:
//!
//! | Tag                  | Payload                                            |
//! |----------------------|----------------------------------------------------|
//! | `TEXT` (1)           | UTF-8 text                                         |
//! | `ECHO` (2)           | UTF-8 text                                         |
//! | `ACTION` (3)         | 1 byte: `START_FIT` = 1, `STOP_FIT` = 2            |
//! | `MODEL_TRANSFER` (4) | u32 len + model, u32 len + fit params              |
//! | `OPTIMIZER_UPDATE`(5)| 1 byte sub-tag (`PARAMETER_INFO`/`PROGRESS`/`RESULT`) + JSON |
//!
//! Readers consume exactly one frame and never buffer past it, so a frame
//! reader can be handed back to the caller between messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{
    ActionKind, Message, OptimizerUpdate, ParameterInfo, ProgressUpdate, ResultInfo,
};
use crate::error::{RemoteFitError, Result};

/// Size of the frame header (tag + length)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum payload size (64 MiB); larger frames are malformed
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    /// Free-form text
    Text = 1,
    /// Liveness probe
    Echo = 2,
    /// Fit control command
    Action = 3,
    /// Model and configuration transfer
    ModelTransfer = 4,
    /// Optimizer event
    OptimizerUpdate = 5,
}

impl MessageTag {
    /// Tag of a message
    pub fn of(message: &Message) -> Self {
        match message {
            Message::Text(_) => Self::Text,
            Message::Echo(_) => Self::Echo,
            Message::Action(_) => Self::Action,
            Message::ModelTransfer { .. } => Self::ModelTransfer,
            Message::OptimizerUpdate(_) => Self::OptimizerUpdate,
        }
    }
}

impl TryFrom<u8> for MessageTag {
    type Error = RemoteFitError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Text),
            2 => Ok(Self::Echo),
            3 => Ok(Self::Action),
            4 => Ok(Self::ModelTransfer),
            5 => Ok(Self::OptimizerUpdate),
            other => Err(RemoteFitError::MalformedFrame(format!(
                "unknown message tag {other}"
            ))),
        }
    }
}

impl Message {
    /// Encode into a complete frame
    pub fn encode(&self) -> Result<Bytes> {
        let payload = self.encode_payload()?;
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(RemoteFitError::MalformedFrame(format!(
                "payload of {} bytes exceeds maximum {}",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(MessageTag::of(self) as u8);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Text(text) | Message::Echo(text) => text.as_bytes().to_vec(),
            Message::Action(kind) => vec![kind.code()],
            Message::ModelTransfer { model, fit_params } => {
                let mut buf = Vec::with_capacity(8 + model.len() + fit_params.len());
                put_blob(&mut buf, model)?;
                put_blob(&mut buf, fit_params)?;
                buf
            },
            Message::OptimizerUpdate(update) => {
                if !update.is_finite() {
                    return Err(RemoteFitError::MalformedFrame(format!(
                        "{} carries a non-finite number",
                        update.kind()
                    )));
                }
                let mut buf = vec![update.code()];
                match update {
                    OptimizerUpdate::ParameterInfo(info) => serde_json::to_writer(&mut buf, info)?,
                    OptimizerUpdate::Progress(progress) => serde_json::to_writer(&mut buf, progress)?,
                    OptimizerUpdate::Result(result) => serde_json::to_writer(&mut buf, result)?,
                }
                buf
            },
        };
        Ok(payload)
    }

    /// Decode a payload for the given tag
    pub fn decode_payload(tag: MessageTag, mut payload: Bytes) -> Result<Self> {
        match tag {
            MessageTag::Text => Ok(Message::Text(utf8(payload)?)),
            MessageTag::Echo => Ok(Message::Echo(utf8(payload)?)),
            MessageTag::Action => {
                if payload.len() != 1 {
                    return Err(RemoteFitError::MalformedFrame(format!(
                        "action payload must be 1 byte, got {}",
                        payload.len()
                    )));
                }
                ActionKind::from_code(payload[0])
                    .map(Message::Action)
                    .ok_or_else(|| {
                        RemoteFitError::MalformedFrame(format!("unknown action {}", payload[0]))
                    })
            },
            MessageTag::ModelTransfer => {
                let model = take_blob(&mut payload, "model")?;
                let fit_params = take_blob(&mut payload, "fit params")?;
                if payload.has_remaining() {
                    return Err(RemoteFitError::MalformedFrame(format!(
                        "{} trailing bytes after model transfer",
                        payload.remaining()
                    )));
                }
                Ok(Message::ModelTransfer { model, fit_params })
            },
            MessageTag::OptimizerUpdate => {
                if !payload.has_remaining() {
                    return Err(RemoteFitError::MalformedFrame(
                        "empty optimizer update".to_string(),
                    ));
                }
                let code = payload.get_u8();
                let update = match code {
                    1 => OptimizerUpdate::ParameterInfo(json::<ParameterInfo>(&payload)?),
                    2 => OptimizerUpdate::Progress(json::<ProgressUpdate>(&payload)?),
                    3 => OptimizerUpdate::Result(json::<ResultInfo>(&payload)?),
                    other => {
                        return Err(RemoteFitError::MalformedFrame(format!(
                            "unknown optimizer update {other}"
                        )))
                    },
                };
                Ok(Message::OptimizerUpdate(update))
            },
        }
    }

    /// Decode one frame from the front of a buffer.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode_frame(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(RemoteFitError::MalformedFrame(format!(
                "frame header needs {FRAME_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let tag = MessageTag::try_from(data[0])?;
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        check_len(len, MAX_FRAME_SIZE)?;

        let end = FRAME_HEADER_SIZE + len as usize;
        if data.len() < end {
            return Err(RemoteFitError::MalformedFrame(format!(
                "declared payload of {len} bytes, only {} available",
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..end]);
        Ok((Self::decode_payload(tag, payload)?, end))
    }
}

/// Read exactly one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary. A stream that ends inside a frame is a `MalformedFrame`.
pub async fn read_message<R>(reader: &mut R, max_frame_size: u32) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match reader.read(&mut tag).await {
        Ok(0) => return Ok(None),
        Ok(_) => {},
        Err(e) => return Err(RemoteFitError::from_read(e, "frame tag")),
    }
    let tag = MessageTag::try_from(tag[0])?;

    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .await
        .map_err(|e| RemoteFitError::from_read(e, "frame length"))?;
    let len = u32::from_be_bytes(len);
    check_len(len, max_frame_size)?;

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RemoteFitError::from_read(e, "frame payload"))?;

    tracing::trace!(?tag, len, "frame received");
    Message::decode_payload(tag, Bytes::from(payload)).map(Some)
}

/// Encode and write one frame, flushing the writer.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn check_len(len: u32, max: u32) -> Result<()> {
    if len > max {
        return Err(RemoteFitError::MalformedFrame(format!(
            "declared payload of {len} bytes exceeds maximum {max}"
        )));
    }
    Ok(())
}

fn put_blob(buf: &mut Vec<u8>, blob: &[u8]) -> Result<()> {
    let len = u32::try_from(blob.len()).map_err(|_| {
        RemoteFitError::MalformedFrame(format!("blob of {} bytes is too large", blob.len()))
    })?;
    buf.put_u32(len);
    buf.extend_from_slice(blob);
    Ok(())
}

fn take_blob(payload: &mut Bytes, what: &str) -> Result<Bytes> {
    if payload.remaining() < 4 {
        return Err(RemoteFitError::MalformedFrame(format!(
            "missing {what} length"
        )));
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(RemoteFitError::MalformedFrame(format!(
            "{what} declares {len} bytes, only {} available",
            payload.remaining()
        )));
    }
    Ok(payload.split_to(len))
}

fn utf8(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| RemoteFitError::MalformedFrame(format!("invalid UTF-8 text: {e}")))
}

fn json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| RemoteFitError::MalformedFrame(format!("invalid update body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::TerminationReason;
    use proptest::prelude::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::text("Fitting started"),
            Message::echo("ping"),
            Message::start_fit(),
            Message::stop_fit(),
            Message::model_transfer(&b"{\"parameters\":[]}"[..], &b"{}"[..]),
            Message::OptimizerUpdate(OptimizerUpdate::ParameterInfo(ParameterInfo {
                names: vec!["a".into(), "b".into()],
                values: vec![1.0, 2.0],
                min_values: vec![0.0, 0.0],
                max_values: vec![5.0, 5.0],
                population: vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            })),
            Message::OptimizerUpdate(OptimizerUpdate::Progress(ProgressUpdate {
                generation: 7,
                fom_history: vec![3.0, 2.0, 1.5],
                simulated: vec![vec![0.1, 0.2, 0.3]],
                best_values: vec![1.0, 2.0],
                new_best: true,
            })),
            Message::OptimizerUpdate(OptimizerUpdate::Result(ResultInfo {
                best_values: vec![1.0, 2.0],
                fom: Some(0.25),
                generations: 40,
                termination: TerminationReason::Stopped,
            })),
        ]
    }

    #[test]
    fn test_every_variant_decodes_to_itself() {
        for message in sample_messages() {
            let frame = message.encode().unwrap();
            let (decoded, consumed) = Message::decode_frame(&frame).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = Message::stop_fit().encode().unwrap();
        assert_eq!(&frame[..], &[3, 0, 0, 0, 1, 2]);

        let frame = Message::text("hi").encode().unwrap();
        assert_eq!(&frame[..], &[1, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_non_finite_update_refused() {
        let progress = ProgressUpdate {
            generation: 1,
            fom_history: vec![1.0],
            simulated: vec![vec![f64::INFINITY]],
            best_values: vec![0.0, 0.0, 1.5],
            new_best: true,
        };
        let err = Message::OptimizerUpdate(OptimizerUpdate::Progress(progress))
            .encode()
            .unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));

        let result = ResultInfo {
            best_values: vec![1.0],
            fom: Some(f64::NAN),
            generations: 3,
            termination: TerminationReason::MaxGenerations,
        };
        assert!(Message::OptimizerUpdate(OptimizerUpdate::Result(result))
            .encode()
            .is_err());
    }

    #[test]
    fn test_failed_result_without_fom_decodes() {
        let message = Message::OptimizerUpdate(OptimizerUpdate::Result(ResultInfo::failed("boom")));
        let frame = message.encode().unwrap();
        assert_eq!(Message::decode_frame(&frame).unwrap().0, message);
    }

    #[test]
    fn test_text_and_echo_are_distinct() {
        let text = Message::text("same").encode().unwrap();
        let echo = Message::echo("same").encode().unwrap();
        assert_ne!(text, echo);
        assert_eq!(Message::decode_frame(&echo).unwrap().0, Message::echo("same"));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Message::decode_frame(&[9, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = Message::decode_frame(&[3, 0, 0, 0, 1, 7]).unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[test]
    fn test_model_transfer_trailing_bytes_rejected() {
        let mut frame = Message::model_transfer(&b"m"[..], &b"p"[..])
            .encode()
            .unwrap()
            .to_vec();
        frame.push(0xFF);
        // Bump the declared length to cover the extra byte
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) + 1;
        frame[1..5].copy_from_slice(&len.to_be_bytes());

        let err = Message::decode_frame(&frame).unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[test]
    fn test_model_transfer_inner_length_overrun() {
        // Outer frame is fine, inner model length claims 50 bytes
        let mut payload = Vec::new();
        payload.extend_from_slice(&50u32.to_be_bytes());
        payload.extend_from_slice(b"short");
        let mut frame = vec![4];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        assert!(Message::decode_frame(&frame).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let err = Message::decode_frame(&[1, 0, 0, 0, 2, 0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut frame = vec![1];
        frame.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let err = Message::decode_frame(&frame).unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_reader_stops_at_frame_boundary() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Message::echo("first").encode().unwrap());
        stream.extend_from_slice(&Message::start_fit().encode().unwrap());

        let mut reader = &stream[..];
        let first = read_message(&mut reader, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(first, Some(Message::echo("first")));
        // Second frame untouched
        assert_eq!(reader.len(), FRAME_HEADER_SIZE + 1);

        let second = read_message(&mut reader, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(second, Some(Message::start_fit()));
        assert_eq!(read_message(&mut reader, MAX_FRAME_SIZE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_malformed() {
        // Declares 100 bytes, delivers 10, then closes
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut frame = vec![1];
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.extend_from_slice(&[b'x'; 10]);
        client.write_all(&frame).await.unwrap();
        drop(client);

        let err = read_message(&mut server, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_truncated_header_is_malformed() {
        let mut reader: &[u8] = &[2, 0, 0];
        let err = read_message(&mut reader, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_reader_respects_smaller_limit() {
        let frame = Message::text("x".repeat(64)).encode().unwrap();
        let mut reader = &frame[..];
        let err = read_message(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, RemoteFitError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = Message::model_transfer(vec![1u8, 2, 3], vec![4u8]);
        write_message(&mut client, &message).await.unwrap();

        let read = read_message(&mut server, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(read, Some(message));
    }

    proptest! {
        #[test]
        fn prop_text_frames_decode_exactly(text in ".*", echo in any::<bool>()) {
            let message = if echo { Message::echo(text) } else { Message::text(text) };
            let frame = message.encode().unwrap();
            let (decoded, consumed) = Message::decode_frame(&frame).unwrap();
            prop_assert_eq!(decoded, message);
            prop_assert_eq!(consumed, frame.len());
        }

        #[test]
        fn prop_model_transfer_decodes_exactly(
            model in proptest::collection::vec(any::<u8>(), 0..512),
            params in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let message = Message::model_transfer(model, params);
            let frame = message.encode().unwrap();
            let (decoded, _) = Message::decode_frame(&frame).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn prop_decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::decode_frame(&data);
        }
    }
}
