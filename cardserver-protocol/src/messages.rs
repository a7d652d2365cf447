//! Request and response messages exchanged with a card server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CardServerFault;
use crate::types::{
    EpgExtensions, ExtensionPayload, ProgramGuideItem, ReceiveInformation, ServerInformation,
    SourceIdentifier, StreamInformation,
};

/// Protocol magic bytes.
pub const MAGIC: [u8; 4] = *b"DVBC";

/// Maximum payload size (64 MiB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Frames are written in blocks of this size.
pub const WRITE_BLOCK_SIZE: usize = 10_000;

/// Message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    AttachProfile = 0x0001,
    Select = 0x0002,
    AddSources = 0x0003,
    RemoveSource = 0x0004,
    RemoveAllSources = 0x0005,
    SetStreamTarget = 0x0006,
    SetZappingSource = 0x0007,
    GetState = 0x0008,
    StartScan = 0x0009,
    EndScan = 0x000A,
    StartEpgCollection = 0x000B,
    EndEpgCollection = 0x000C,
    CustomAction = 0x000D,
    LoadExtensions = 0x000E,

    Response = 0x8000,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(MessageType::AttachProfile),
            0x0002 => Ok(MessageType::Select),
            0x0003 => Ok(MessageType::AddSources),
            0x0004 => Ok(MessageType::RemoveSource),
            0x0005 => Ok(MessageType::RemoveAllSources),
            0x0006 => Ok(MessageType::SetStreamTarget),
            0x0007 => Ok(MessageType::SetZappingSource),
            0x0008 => Ok(MessageType::GetState),
            0x0009 => Ok(MessageType::StartScan),
            0x000A => Ok(MessageType::EndScan),
            0x000B => Ok(MessageType::StartEpgCollection),
            0x000C => Ok(MessageType::EndEpgCollection),
            0x000D => Ok(MessageType::CustomAction),
            0x000E => Ok(MessageType::LoadExtensions),
            0x8000 => Ok(MessageType::Response),
            other => Err(other),
        }
    }
}

/// A command for the card server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    AttachProfile {
        profile: String,
        reset: bool,
        disable_pcr_from_h264: bool,
        disable_pcr_from_mpeg2: bool,
    },
    Select {
        selection_key: String,
    },
    AddSources {
        sources: Vec<ReceiveInformation>,
    },
    RemoveSource {
        source: SourceIdentifier,
        unique_identifier: Uuid,
    },
    RemoveAllSources,
    SetStreamTarget {
        source: SourceIdentifier,
        unique_identifier: Uuid,
        target: Option<String>,
    },
    SetZappingSource {
        selection_key: String,
        target: String,
    },
    GetState,
    StartScan,
    EndScan {
        /// `None` leaves the profile untouched, `Some(true)` merges, `Some(false)` replaces.
        update_profile: Option<bool>,
    },
    StartEpgCollection {
        sources: Vec<SourceIdentifier>,
        extensions: EpgExtensions,
    },
    EndEpgCollection,
    CustomAction {
        action: String,
        input: serde_json::Value,
    },
    LoadExtensions {
        payload: ExtensionPayload,
    },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::AttachProfile { .. } => MessageType::AttachProfile,
            Request::Select { .. } => MessageType::Select,
            Request::AddSources { .. } => MessageType::AddSources,
            Request::RemoveSource { .. } => MessageType::RemoveSource,
            Request::RemoveAllSources => MessageType::RemoveAllSources,
            Request::SetStreamTarget { .. } => MessageType::SetStreamTarget,
            Request::SetZappingSource { .. } => MessageType::SetZappingSource,
            Request::GetState => MessageType::GetState,
            Request::StartScan => MessageType::StartScan,
            Request::EndScan { .. } => MessageType::EndScan,
            Request::StartEpgCollection { .. } => MessageType::StartEpgCollection,
            Request::EndEpgCollection => MessageType::EndEpgCollection,
            Request::CustomAction { .. } => MessageType::CustomAction,
            Request::LoadExtensions { .. } => MessageType::LoadExtensions,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::AttachProfile { .. } => "AttachProfile",
            Request::Select { .. } => "Select",
            Request::AddSources { .. } => "AddSources",
            Request::RemoveSource { .. } => "RemoveSource",
            Request::RemoveAllSources => "RemoveAllSources",
            Request::SetStreamTarget { .. } => "SetStreamTarget",
            Request::SetZappingSource { .. } => "SetZappingSource",
            Request::GetState => "GetState",
            Request::StartScan => "StartScan",
            Request::EndScan { .. } => "EndScan",
            Request::StartEpgCollection { .. } => "StartEpgCollection",
            Request::EndEpgCollection => "EndEpgCollection",
            Request::CustomAction { .. } => "CustomAction",
            Request::LoadExtensions { .. } => "LoadExtensions",
        }
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum ResponseData {
    #[default]
    None,
    Streams(Vec<StreamInformation>),
    State(ServerInformation),
    Guide(Vec<ProgramGuideItem>),
    Custom(serde_json::Value),
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok(ResponseData),
    Fault(CardServerFault),
}

impl From<Result<ResponseData, CardServerFault>> for Response {
    fn from(result: Result<ResponseData, CardServerFault>) -> Self {
        match result {
            Ok(data) => Response::Ok(data),
            Err(fault) => Response::Fault(fault),
        }
    }
}

impl From<Response> for Result<ResponseData, CardServerFault> {
    fn from(response: Response) -> Self {
        match response {
            Response::Ok(data) => Ok(data),
            Response::Fault(fault) => Err(fault),
        }
    }
}
