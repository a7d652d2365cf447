//! Shared definitions for the DVB card server.
//!
//! This crate defines the data model, the fault taxonomy and the framed
//! protocol used between a card server front and an out-of-process host.
//!
//! # Frame Format
//!
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "DVBC" | u32 LE | u16 LE |  (JSON, length)  |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```
//!
//! # Example
//!
//! ```rust
//! use cardserver_protocol::{decode_header, decode_request, encode_request, Request, HEADER_SIZE};
//!
//! let request = Request::Select {
//!     selection_key: "@11836000@19.2E@DeviceA".to_string(),
//! };
//! let encoded = encode_request(&request).unwrap();
//!
//! let header = decode_header(&encoded).unwrap().unwrap();
//! let decoded = decode_request(header.message_type, &encoded[HEADER_SIZE..]).unwrap();
//! assert_eq!(decoded, request);
//! ```
//!
//! Selection keys have the form `source@group@location@profile`:
//!
//! ```rust
//! use cardserver_protocol::{SourceIdentifier, SourceSelection};
//!
//! let selection = SourceSelection::parse("(1, 1101, 28106)@11836000@19.2E@DeviceA").unwrap();
//! assert_eq!(selection.source, Some(SourceIdentifier::new(1, 1101, 28106)));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    decode_header, decode_request, decode_response, encode_request, encode_response, read_frame,
    write_frame, FrameHeader, HEADER_SIZE,
};
pub use error::{CardServerFault, FaultKind, ProtocolError};
pub use messages::{
    MessageType, Request, Response, ResponseData, MAGIC, MAX_FRAME_SIZE, WRITE_BLOCK_SIZE,
};
pub use types::{
    EpgExtensions, ExtensionPayload, FileInformation, GroupKey, LanguageMode, LanguageSelection,
    ProgramGuideItem, ReceiveInformation, ServerInformation, ServiceInformation, SignalInformation,
    SourceIdentifier, SourceSelection, StreamInformation, StreamSelection,
};
