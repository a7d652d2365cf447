//! Codec for encoding and decoding protocol messages.
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "DVBC" | u32 LE | u16 LE |  (JSON, length)  |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::messages::{MessageType, Request, Response, MAGIC, MAX_FRAME_SIZE, WRITE_BLOCK_SIZE};

/// Frame header size: 4 (magic) + 4 (length) + 2 (type) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Frame header information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub payload_length: u32,
}

fn encode_frame(message_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let payload_len = payload.len();
    if payload_len > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge(payload_len as u32, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload_len);
    frame.put_slice(&MAGIC);
    frame.put_u32_le(payload_len as u32);
    frame.put_u16_le(message_type as u16);
    frame.put_slice(payload);

    Ok(frame.freeze())
}

/// Encode a request into a frame.
pub fn encode_request(request: &Request) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(request).map_err(|e| ProtocolError::EncodeError(e.to_string()))?;
    encode_frame(request.message_type(), &payload)
}

/// Encode a response into a frame.
pub fn encode_response(response: &Response) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(response).map_err(|e| ProtocolError::EncodeError(e.to_string()))?;
    encode_frame(MessageType::Response, &payload)
}

/// Decode a frame header.
///
/// Returns `Ok(None)` if there are not enough bytes yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cursor = buf;
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let payload_length = cursor.get_u32_le();
    if payload_length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_length, MAX_FRAME_SIZE));
    }

    let raw_type = cursor.get_u16_le();
    let message_type = MessageType::try_from(raw_type).map_err(ProtocolError::UnknownMessageType)?;

    Ok(Some(FrameHeader {
        message_type,
        payload_length,
    }))
}

/// Decode a request payload.
pub fn decode_request(message_type: MessageType, payload: &[u8]) -> Result<Request, ProtocolError> {
    let request: Request =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::DecodeError(e.to_string()))?;

    if request.message_type() != message_type {
        return Err(ProtocolError::TypeMismatch {
            header: message_type as u16,
            payload: request.message_type() as u16,
        });
    }

    Ok(request)
}

/// Decode a response payload.
pub fn decode_response(message_type: MessageType, payload: &[u8]) -> Result<Response, ProtocolError> {
    if message_type != MessageType::Response {
        return Err(ProtocolError::TypeMismatch {
            header: message_type as u16,
            payload: MessageType::Response as u16,
        });
    }

    serde_json::from_slice(payload).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}

/// Write a frame in fixed-size blocks and flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError> {
    for block in frame.chunks(WRITE_BLOCK_SIZE) {
        writer.write_all(block)?;
    }
    writer.flush()?;
    Ok(())
}

/// `read` that retries when interrupted by a signal.
fn read_retrying<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Read one complete frame.
///
/// Returns `Ok(None)` on a clean end of stream before the first header byte.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>, ProtocolError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = read_retrying(reader, &mut header_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::IncompleteFrame {
                expected: HEADER_SIZE,
                actual: filled,
            });
        }
        filled += n;
    }

    let header = decode_header(&header_buf)?.ok_or(ProtocolError::IncompleteFrame {
        expected: HEADER_SIZE,
        actual: filled,
    })?;

    let expected = header.payload_length as usize;
    let mut payload = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        let n = read_retrying(reader, &mut payload[filled..])?;
        if n == 0 {
            return Err(ProtocolError::IncompleteFrame {
                expected,
                actual: filled,
            });
        }
        filled += n;
    }

    Ok(Some((header, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CardServerFault, FaultKind};
    use crate::messages::ResponseData;
    use crate::types::{ReceiveInformation, StreamSelection};
    use std::io::Cursor;

    /// Hands out one byte per call and is interrupted before each of them.
    struct Interrupting {
        data: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for Interrupting {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(std::io::ErrorKind::Interrupted.into());
            }
            let len = buf.len().min(1);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn test_read_frame_retries_interrupted_reads() {
        let mut input = Vec::new();
        write_frame(&mut input, &encode_request(&Request::GetState).unwrap()).unwrap();
        let mut reader = Interrupting {
            data: Cursor::new(input),
            interrupt: false,
        };

        let (header, payload) = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::GetState);
        assert_eq!(decode_request(header.message_type, &payload).unwrap(), Request::GetState);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_request(&Request::GetState).unwrap();
        assert_eq!(&frame[0..4], b"DVBC");
        let header = decode_header(&frame).unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::GetState);
        assert_eq!(header.payload_length as usize, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_decode_header_incomplete() {
        let frame = encode_request(&Request::GetState).unwrap();
        assert!(decode_header(&frame[..HEADER_SIZE - 1]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut frame = encode_request(&Request::GetState).unwrap().to_vec();
        frame[0] = b'X';
        assert!(matches!(decode_header(&frame), Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut frame = encode_request(&Request::GetState).unwrap().to_vec();
        frame[8] = 0x77;
        frame[9] = 0x07;
        assert!(matches!(decode_header(&frame), Err(ProtocolError::UnknownMessageType(0x0777))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut frame = BytesMut::new();
        frame.put_slice(&MAGIC);
        frame.put_u32_le(MAX_FRAME_SIZE + 1);
        frame.put_u16_le(MessageType::GetState as u16);
        assert!(matches!(decode_header(&frame), Err(ProtocolError::FrameTooLarge(_, _))));
    }

    #[test]
    fn test_type_mismatch() {
        let payload = serde_json::to_vec(&Request::GetState).unwrap();
        let err = decode_request(MessageType::Select, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));
    }

    #[test]
    fn test_read_write_frames_over_stream() {
        let request = Request::AddSources {
            sources: vec![ReceiveInformation::new(
                "(1, 1101, 28106)@11836000@19.2E@DeviceA",
                StreamSelection::everything(),
            )],
        };
        let response = Response::Fault(CardServerFault::new(FaultKind::SourceInUse, "in use"));

        let mut wire = Vec::new();
        write_frame(&mut wire, &encode_request(&request).unwrap()).unwrap();
        write_frame(&mut wire, &encode_response(&response).unwrap()).unwrap();

        let mut cursor = Cursor::new(wire);
        let (header, payload) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decode_request(header.message_type, &payload).unwrap(), request);

        let (header, payload) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decode_response(header.message_type, &payload).unwrap(), response);

        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_payload() {
        let frame = encode_response(&Response::Ok(ResponseData::None)).unwrap();
        let mut cursor = Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(matches!(read_frame(&mut cursor), Err(ProtocolError::IncompleteFrame { .. })));
    }

    #[test]
    fn test_large_frame_written_in_blocks() {
        struct CountingWriter {
            data: Vec<u8>,
            writes: usize,
        }

        impl Write for CountingWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                assert!(buf.len() <= WRITE_BLOCK_SIZE);
                self.writes += 1;
                self.data.extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let input = serde_json::Value::String("x".repeat(25_000));
        let request = Request::CustomAction {
            action: "echo".into(),
            input,
        };
        let frame = encode_request(&request).unwrap();

        let mut writer = CountingWriter { data: Vec::new(), writes: 0 };
        write_frame(&mut writer, &frame).unwrap();
        assert_eq!(writer.writes, frame.len().div_ceil(WRITE_BLOCK_SIZE));

        let (header, payload) = read_frame(&mut Cursor::new(writer.data)).unwrap().unwrap();
        assert_eq!(decode_request(header.message_type, &payload).unwrap(), request);
    }
}
