//! Serving a card server to a remote front over a pair of byte streams.

use std::io::{Read, Write};

use log::{debug, info, warn};
use serde_json::Value;

use cardserver_protocol::{
    decode_request, encode_response, read_frame, write_frame, CardServerFault, ProtocolError, Request, Response,
    ResponseData,
};

use super::implementation::{AsyncHandle, Outcome, ServerImplementation};

fn wait<T>(handle: Result<AsyncHandle<T>, CardServerFault>) -> Result<T, CardServerFault> {
    handle?.result()
}

/// Run one request against the local server and wait for its result.
fn dispatch(server: &ServerImplementation, request: Request) -> Outcome {
    let data = match request {
        Request::AttachProfile {
            profile,
            reset,
            disable_pcr_from_h264,
            disable_pcr_from_mpeg2,
        } => {
            wait(server.begin_attach_profile(&profile, reset, disable_pcr_from_h264, disable_pcr_from_mpeg2))?;
            ResponseData::None
        }
        Request::Select { selection_key } => {
            wait(server.begin_select(&selection_key))?;
            ResponseData::None
        }
        Request::AddSources { sources } => ResponseData::Streams(wait(server.begin_add_sources(sources))?),
        Request::RemoveSource {
            source,
            unique_identifier,
        } => {
            wait(server.begin_remove_source(source, unique_identifier))?;
            ResponseData::None
        }
        Request::RemoveAllSources => {
            wait(server.begin_remove_all_sources())?;
            ResponseData::None
        }
        Request::SetStreamTarget {
            source,
            unique_identifier,
            target,
        } => {
            wait(server.begin_set_stream_target(source, unique_identifier, target.as_deref()))?;
            ResponseData::None
        }
        Request::SetZappingSource { selection_key, target } => {
            ResponseData::State(wait(server.begin_set_zapping_source(&selection_key, &target))?)
        }
        Request::GetState => ResponseData::State(wait(server.begin_get_state())?),
        Request::StartScan => {
            wait(server.begin_start_scan())?;
            ResponseData::None
        }
        Request::EndScan { update_profile } => {
            wait(server.begin_end_scan(update_profile))?;
            ResponseData::None
        }
        Request::StartEpgCollection { sources, extensions } => {
            wait(server.begin_start_epg_collection(sources, extensions))?;
            ResponseData::None
        }
        Request::EndEpgCollection => ResponseData::Guide(wait(server.begin_end_epg_collection())?),
        Request::CustomAction { action, input } => {
            ResponseData::Custom(wait(server.begin_custom_action::<Value, Value>(&action, &input))?)
        }
        Request::LoadExtensions { payload } => {
            wait(server.begin_load_extensions(payload))?;
            ResponseData::None
        }
    };
    Ok(data)
}

/// Answer framed requests from `reader` on `writer` until the reader is closed.
///
/// A request that cannot be decoded is answered with a fault; a broken
/// frame ends the session.
pub fn serve<R, W>(server: &ServerImplementation, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    info!("[Host] Serving requests");
    let mut handled = 0usize;

    while let Some((header, payload)) = read_frame(reader)? {
        let outcome = match decode_request(header.message_type, &payload) {
            Ok(request) => {
                let name = request.name();
                let outcome = dispatch(server, request);
                match &outcome {
                    Ok(_) => debug!("[Host] {} done", name),
                    Err(fault) => debug!("[Host] {} failed: {}", name, fault),
                }
                outcome
            }
            Err(e) => {
                warn!("[Host] Rejecting undecodable request: {}", e);
                Err(CardServerFault::from(e))
            }
        };

        let frame = encode_response(&Response::from(outcome))?;
        write_frame(writer, &frame)?;
        handled += 1;
    }

    info!("[Host] Connection closed after {} requests", handled);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use cardserver_protocol::{decode_response, encode_request, FaultKind, MessageType, SourceSelection};

    use crate::config::Config;
    use crate::device::sim::SimulatedEnvironment;
    use crate::device::Profile;
    use crate::server::InMemoryCardServer;

    fn server() -> ServerImplementation {
        let profile = Profile {
            name: "DeviceA".into(),
            sources: vec![SourceSelection::parse("(1, 1101, 28106)@11836000@19.2E@DeviceA").unwrap()],
            ..Default::default()
        };
        let sim = SimulatedEnvironment::new().with_profile(profile, None);
        InMemoryCardServer::create(sim.environment(), Config::default())
    }

    fn frames(requests: &[Request]) -> Vec<u8> {
        let mut input = Vec::new();
        for request in requests {
            write_frame(&mut input, &encode_request(request).unwrap()).unwrap();
        }
        input
    }

    fn responses(output: Vec<u8>) -> Vec<Response> {
        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some((header, payload)) = read_frame(&mut reader).unwrap() {
            assert_eq!(header.message_type, MessageType::Response);
            responses.push(decode_response(header.message_type, &payload).unwrap());
        }
        responses
    }

    #[test]
    fn test_serve_answers_every_request() {
        let server = server();
        let input = frames(&[
            Request::GetState,
            Request::AttachProfile {
                profile: "DeviceA".into(),
                reset: false,
                disable_pcr_from_h264: false,
                disable_pcr_from_mpeg2: false,
            },
            Request::Select {
                selection_key: "@11836000@19.2E@DeviceA".into(),
            },
            Request::GetState,
        ]);

        let mut output = Vec::new();
        serve(&server, &mut Cursor::new(input), &mut output).unwrap();

        let responses = responses(output);
        assert_eq!(responses.len(), 4);
        match &responses[0] {
            Response::Fault(fault) => assert_eq!(fault.kind, FaultKind::ProfileNotAttached),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(responses[1], Response::Ok(ResponseData::None));
        assert_eq!(responses[2], Response::Ok(ResponseData::None));
        match &responses[3] {
            Response::Ok(ResponseData::State(state)) => {
                assert_eq!(state.selection.as_deref(), Some("@11836000@19.2E@DeviceA"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serve_rejects_truncated_frame() {
        let server = server();
        let mut input = frames(&[Request::GetState]);
        input.truncate(input.len() - 1);

        let mut output = Vec::new();
        assert!(serve(&server, &mut Cursor::new(input), &mut output).is_err());
        assert!(output.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let server = server();
        let mut output = Vec::new();
        serve(&server, &mut Cursor::new(Vec::new()), &mut output).unwrap();
        assert!(output.is_empty());
    }
}
