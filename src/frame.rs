//! TLV frame codec for the PBX-facing TCP leg.
//!
//! Wire format: `1 byte type | 2 bytes length (big-endian) | payload`.
//! This mirrors the AudioSocket framing the PBX side speaks; the bridge
//! is both a reader and writer of this format on the same socket.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const TYPE_HANGUP: u8 = 0x00;
pub const TYPE_UUID: u8 = 0x01;
pub const TYPE_DTMF: u8 = 0x03;
pub const TYPE_AUDIO_8K: u8 = 0x10;
pub const TYPE_AUDIO_16K: u8 = 0x12;
pub const TYPE_AUDIO_24K: u8 = 0x13;
pub const TYPE_AUDIO_48K: u8 = 0x16;
pub const TYPE_ERROR: u8 = 0xFF;

/// 20ms of 16-bit PCM at each supported sample rate.
pub const AUDIO_8K_FRAME_BYTES: usize = 320;
pub const AUDIO_16K_FRAME_BYTES: usize = 640;
/// Deployed default: 24kHz audio, 960-byte payload (20ms of 16-bit PCM).
pub const AUDIO_24K_FRAME_BYTES: usize = 960;
pub const AUDIO_48K_FRAME_BYTES: usize = 1920;

const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the {1}-byte limit")]
    TooLarge(usize, usize),
    #[error("expected a UUID frame first, got type {0:#04x}")]
    MissingUuidFirst(u8),
    #[error("audio frame for type {0:#04x} had unexpected length {1}")]
    BadAudioLength(u8, usize),
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hangup,
    Uuid(String),
    Dtmf(u8),
    Audio8k(Vec<u8>),
    Audio16k(Vec<u8>),
    Audio24k(Vec<u8>),
    Audio48k(Vec<u8>),
    Error(Vec<u8>),
}

impl Frame {
    fn type_byte(&self) -> u8 {
        match self {
            Frame::Hangup => TYPE_HANGUP,
            Frame::Uuid(_) => TYPE_UUID,
            Frame::Dtmf(_) => TYPE_DTMF,
            Frame::Audio8k(_) => TYPE_AUDIO_8K,
            Frame::Audio16k(_) => TYPE_AUDIO_16K,
            Frame::Audio24k(_) => TYPE_AUDIO_24K,
            Frame::Audio48k(_) => TYPE_AUDIO_48K,
            Frame::Error(_) => TYPE_ERROR,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Hangup => Vec::new(),
            Frame::Uuid(s) => s.as_bytes().to_vec(),
            Frame::Dtmf(digit) => vec![*digit],
            Frame::Audio8k(pcm) | Frame::Audio16k(pcm) | Frame::Audio24k(pcm) | Frame::Audio48k(pcm) => {
                pcm.clone()
            }
            Frame::Error(msg) => msg.clone(),
        }
    }

    /// Encodes this frame onto the wire as `type | len | payload`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(payload.len(), MAX_PAYLOAD_LEN));
        }
        let mut out = Vec::with_capacity(3 + payload.len());
        out.push(self.type_byte());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn from_type_and_payload(ty: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        match ty {
            TYPE_HANGUP => Ok(Frame::Hangup),
            TYPE_UUID => {
                let s = String::from_utf8_lossy(&payload).into_owned();
                Ok(Frame::Uuid(s))
            }
            TYPE_DTMF => {
                let digit = *payload.first().ok_or(FrameError::BadAudioLength(ty, 0))?;
                Ok(Frame::Dtmf(digit))
            }
            TYPE_AUDIO_8K => {
                if payload.len() != AUDIO_8K_FRAME_BYTES {
                    return Err(FrameError::BadAudioLength(ty, payload.len()));
                }
                Ok(Frame::Audio8k(payload))
            }
            TYPE_AUDIO_16K => {
                if payload.len() != AUDIO_16K_FRAME_BYTES {
                    return Err(FrameError::BadAudioLength(ty, payload.len()));
                }
                Ok(Frame::Audio16k(payload))
            }
            TYPE_AUDIO_24K => {
                if payload.len() != AUDIO_24K_FRAME_BYTES {
                    return Err(FrameError::BadAudioLength(ty, payload.len()));
                }
                Ok(Frame::Audio24k(payload))
            }
            TYPE_AUDIO_48K => {
                if payload.len() != AUDIO_48K_FRAME_BYTES {
                    return Err(FrameError::BadAudioLength(ty, payload.len()));
                }
                Ok(Frame::Audio48k(payload))
            }
            TYPE_ERROR => Ok(Frame::Error(payload)),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Reads one frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let ty = reader.read_u8().await?;
    let len = reader.read_u16().await? as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Frame::from_type_and_payload(ty, payload)
}

/// Writes one frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Reads the mandatory leading UUID frame; any other first frame is a
/// protocol error per spec.
pub async fn read_leading_uuid<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<String, FrameError> {
    match read_frame(reader).await? {
        Frame::Uuid(id) => Ok(id),
        other => Err(FrameError::MissingUuidFirst(other.type_byte())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_audio_24k_frame() {
        let frame = Frame::Audio24k(vec![0u8; AUDIO_24K_FRAME_BYTES]);
        let encoded = frame.encode().unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn round_trips_uuid_frame() {
        let frame = Frame::Uuid("abc-123".to_string());
        let encoded = frame.encode().unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn rejects_bad_24k_length() {
        let mut encoded = vec![TYPE_AUDIO_24K];
        encoded.extend_from_slice(&100u16.to_be_bytes());
        encoded.extend_from_slice(&vec![0u8; 100]);
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadAudioLength(TYPE_AUDIO_24K, 100)));
    }

    #[tokio::test]
    async fn leading_frame_must_be_uuid() {
        let frame = Frame::Dtmf(5);
        let encoded = frame.encode().unwrap();
        let mut cursor = Cursor::new(encoded);
        let err = read_leading_uuid(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::MissingUuidFirst(TYPE_DTMF)));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let mut encoded = vec![0x7Fu8];
        encoded.extend_from_slice(&0u16.to_be_bytes());
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0x7F)));
    }

    #[tokio::test]
    async fn rejects_bad_8k_length() {
        let mut encoded = vec![TYPE_AUDIO_8K];
        encoded.extend_from_slice(&10u16.to_be_bytes());
        encoded.extend_from_slice(&vec![0u8; 10]);
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadAudioLength(TYPE_AUDIO_8K, 10)));
    }

    #[tokio::test]
    async fn rejects_bad_16k_length() {
        let mut encoded = vec![TYPE_AUDIO_16K];
        encoded.extend_from_slice(&10u16.to_be_bytes());
        encoded.extend_from_slice(&vec![0u8; 10]);
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadAudioLength(TYPE_AUDIO_16K, 10)));
    }

    #[tokio::test]
    async fn rejects_bad_48k_length() {
        let mut encoded = vec![TYPE_AUDIO_48K];
        encoded.extend_from_slice(&10u16.to_be_bytes());
        encoded.extend_from_slice(&vec![0u8; 10]);
        let mut cursor = Cursor::new(encoded);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadAudioLength(TYPE_AUDIO_48K, 10)));
    }

    #[tokio::test]
    async fn round_trips_8k_and_16k_and_48k_frames() {
        for frame in [
            Frame::Audio8k(vec![0u8; AUDIO_8K_FRAME_BYTES]),
            Frame::Audio16k(vec![0u8; AUDIO_16K_FRAME_BYTES]),
            Frame::Audio48k(vec![0u8; AUDIO_48K_FRAME_BYTES]),
        ] {
            let encoded = frame.encode().unwrap();
            let mut cursor = Cursor::new(encoded);
            let decoded = read_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded, frame);
        }
    }
}
