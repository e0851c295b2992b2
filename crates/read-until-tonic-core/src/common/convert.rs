//! Conversions between the protobuf messages and the `read_until` domain
//! model.
//!
//! Outbound conversions are infallible. Inbound conversions fail with
//! [`Error::Protocol`] when the server sends an action id this client never
//! issued in decimal form, or an action response code it does not know.
//!
//! The wire has no explicit per-chunk sequence number; a chunk's
//! `chunk_start_sample` increases monotonically within a read and is used in
//! its place.

use crate::{
    Error, Result,
    proto::{
        GetLiveReadsRequest, GetLiveReadsResponse,
        get_live_reads_request::{self as request, action},
        get_live_reads_response::{ActionResponse, ReadData, action_response},
    },
};
use read_until::{
    ActionAck, ActionKind, ActionOutcome, ActionRequest, ActionTarget, ChannelId, ChunkStats,
    CorrelationId, InboundMessage, OutboundMessage, RawDataType, StreamSetup, WorkUnit,
};

impl From<OutboundMessage> for GetLiveReadsRequest {
    fn from(message: OutboundMessage) -> Self {
        let request = match message {
            OutboundMessage::Setup(setup) => request::Request::Setup(setup.into()),
            OutboundMessage::Actions(actions) => request::Request::Actions(request::Actions {
                actions: actions.into_iter().map(Into::into).collect(),
            }),
        };
        Self {
            request: Some(request),
        }
    }
}

impl From<StreamSetup> for request::StreamSetup {
    fn from(setup: StreamSetup) -> Self {
        let raw_data_type = match setup.raw_data_type {
            RawDataType::None => request::RawDataType::None,
            RawDataType::Calibrated => request::RawDataType::Calibrated,
            RawDataType::Uncalibrated => request::RawDataType::Uncalibrated,
            RawDataType::KeepPrevious => request::RawDataType::KeepLast,
        };
        Self {
            first_channel: setup.first_channel,
            last_channel: setup.last_channel,
            raw_data_type: raw_data_type.into(),
            sample_minimum_chunk_size: setup.min_chunk_size,
        }
    }
}

impl From<ActionRequest> for request::Action {
    fn from(action: ActionRequest) -> Self {
        let read = match action.target {
            ActionTarget::Id(id) => action::Read::Id(id),
            ActionTarget::Number(number) => action::Read::Number(number),
        };
        let kind = match action.kind {
            ActionKind::Unblock { duration } => action::Action::Unblock(request::UnblockAction {
                duration: duration.as_secs_f64(),
            }),
            ActionKind::StopFurtherData => {
                action::Action::StopFurtherData(request::StopFurtherData {})
            }
        };
        Self {
            action_id: action.correlation_id.to_string(),
            channel: action.channel,
            read: Some(read),
            action: Some(kind),
        }
    }
}

/// Builds a work unit from a channel's read data.
pub fn work_unit(channel: ChannelId, read: ReadData) -> WorkUnit {
    WorkUnit {
        channel,
        item_id: read.id,
        item_number: read.number,
        sequence: read.chunk_start_sample,
        payload: read.raw_data,
        start_sample: read.start_sample,
        chunk_start_sample: read.chunk_start_sample,
        chunk_length: read.chunk_length,
        stats: ChunkStats {
            median_before: read.median_before,
            median: read.median,
            classifications: read.chunk_classifications,
        },
    }
}

/// Maps an action response onto the acknowledgment it stands for.
///
/// # Errors
///
/// [`Error::Protocol`] if the action id is not a decimal correlation id or the
/// response code is unknown.
pub fn action_ack(response: &ActionResponse) -> Result<ActionAck> {
    let correlation_id =
        response
            .action_id
            .parse::<CorrelationId>()
            .map_err(|e| Error::Protocol {
                reason: format!("malformed action id '{}': {e}", response.action_id),
            })?;

    let outcome = match action_response::Response::try_from(response.response) {
        Ok(action_response::Response::Success) => ActionOutcome::Success,
        Ok(action_response::Response::FailedReadFinished) => ActionOutcome::AlreadyFinished,
        Err(_) => {
            return Err(Error::Protocol {
                reason: format!(
                    "unknown response code {} for action {correlation_id}",
                    response.response
                ),
            });
        }
    };

    Ok(ActionAck {
        correlation_id,
        outcome,
    })
}

impl TryFrom<GetLiveReadsResponse> for InboundMessage {
    type Error = Error;

    fn try_from(response: GetLiveReadsResponse) -> Result<Self> {
        let acks = response
            .action_responses
            .iter()
            .map(action_ack)
            .collect::<Result<Vec<_>>>()?;

        let units = response
            .channels
            .into_iter()
            .map(|(channel, read)| (channel, work_unit(channel, read)))
            .collect();

        Ok(Self {
            samples_since_start: response.samples_since_start,
            seconds_since_start: response.seconds_since_start,
            units,
            acks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use core::time::Duration;

    #[test]
    fn setup_maps_every_field() {
        let request = GetLiveReadsRequest::from(OutboundMessage::Setup(StreamSetup {
            first_channel: 3,
            last_channel: 9,
            raw_data_type: RawDataType::KeepPrevious,
            min_chunk_size: 200,
        }));

        let Some(request::Request::Setup(setup)) = request.request else {
            panic!("expected a setup request");
        };
        assert_eq!(setup.first_channel, 3);
        assert_eq!(setup.last_channel, 9);
        assert_eq!(setup.raw_data_type, i32::from(request::RawDataType::KeepLast));
        assert_eq!(setup.sample_minimum_chunk_size, 200);
    }

    #[test]
    fn actions_carry_decimal_ids_and_targets() {
        let request = GetLiveReadsRequest::from(OutboundMessage::Actions(vec![
            ActionRequest {
                correlation_id: CorrelationId::from_raw(17),
                channel: 4,
                target: ActionTarget::Number(12),
                kind: ActionKind::Unblock {
                    duration: Duration::from_millis(100),
                },
            },
            ActionRequest {
                correlation_id: CorrelationId::from_raw(18),
                channel: 5,
                target: ActionTarget::Id("read-a".to_string()),
                kind: ActionKind::StopFurtherData,
            },
        ]));

        let Some(request::Request::Actions(batch)) = request.request else {
            panic!("expected an action batch");
        };
        let [unblock, stop] = batch.actions.as_slice() else {
            panic!("expected two actions");
        };

        assert_eq!(unblock.action_id, "17");
        assert_eq!(unblock.channel, 4);
        assert_eq!(unblock.read, Some(action::Read::Number(12)));
        assert_eq!(
            unblock.action,
            Some(action::Action::Unblock(request::UnblockAction { duration: 0.1 }))
        );

        assert_eq!(stop.action_id, "18");
        assert_eq!(stop.read, Some(action::Read::Id("read-a".to_string())));
        assert_eq!(
            stop.action,
            Some(action::Action::StopFurtherData(request::StopFurtherData {}))
        );
    }

    #[test]
    fn response_becomes_inbound_message() {
        let response = GetLiveReadsResponse {
            samples_since_start: 8_000,
            seconds_since_start: 2.0,
            channels: [(
                7,
                ReadData {
                    id: "read-a".to_string(),
                    number: 3,
                    start_sample: 1_000,
                    chunk_start_sample: 1_400,
                    chunk_length: 4,
                    chunk_classifications: vec![83],
                    raw_data: Bytes::from_static(b"\x01\x02\x03\x04"),
                    median_before: 210.0,
                    median: 95.0,
                },
            )]
            .into_iter()
            .collect(),
            action_responses: vec![ActionResponse {
                action_id: "42".to_string(),
                response: action_response::Response::FailedReadFinished.into(),
            }],
        };

        let message = InboundMessage::try_from(response).unwrap();
        assert_eq!(message.samples_since_start, 8_000);
        assert_eq!(
            message.acks,
            vec![ActionAck {
                correlation_id: CorrelationId::from_raw(42),
                outcome: ActionOutcome::AlreadyFinished,
            }]
        );

        let [(channel, unit)] = message.units.as_slice() else {
            panic!("expected one unit");
        };
        assert_eq!(*channel, 7);
        assert_eq!(unit.channel, 7);
        assert_eq!(unit.item_id, "read-a");
        assert_eq!(unit.item_number, 3);
        assert_eq!(unit.sequence, 1_400);
        assert_eq!(unit.chunk_end_sample(), 1_404);
        assert_eq!(unit.stats.classifications, vec![83]);
    }

    #[test]
    fn unknown_response_code_is_a_protocol_violation() {
        let response = ActionResponse {
            action_id: "1".to_string(),
            response: 9,
        };
        assert!(matches!(action_ack(&response), Err(Error::Protocol { .. })));

        let converted: read_until::Error = action_ack(&response).unwrap_err().into();
        assert!(!converted.is_retryable());
    }

    #[test]
    fn foreign_action_id_is_a_protocol_violation() {
        let response = ActionResponse {
            action_id: "6f1c2a9e-uuid".to_string(),
            response: action_response::Response::Success.into(),
        };
        assert!(matches!(action_ack(&response), Err(Error::Protocol { .. })));
    }
}
