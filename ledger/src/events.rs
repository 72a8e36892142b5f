// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain event schema for the pledge contract family and decoding of raw
//! logs into [`LedgerEvent`].
//!
//! ```text
//!   RawLog ──► event_identity() ──► H256 (queue key, store key)
//!      │
//!      └────► LedgerEvent::decode() ──► Transfer | CancelProject | GiverAdded | ...
//!                                       └─► Unknown (persisted, rejected on dispatch)
//! ```

use crate::error::{LedgerError, LedgerResult};
use crate::types::{AdminId, PledgeId, RawLog};
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::Serialize;
use strum::IntoEnumIterator;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::Display)]
pub enum EventKind {
    Transfer,
    CancelProject,
    GiverAdded,
    GiverUpdated,
    DelegateAdded,
    DelegateUpdated,
    ProjectAdded,
    ProjectUpdated,
    AuthorizePayment,
    SetApp,
    RequestReview,
    ApproveCompleted,
    RejectCompleted,
    ReviewerChanged,
    RecipientChanged,
    PaymentCollected,
}

impl EventKind {
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::Transfer => "Transfer(uint256,uint256,uint256)",
            EventKind::CancelProject => "CancelProject(uint256)",
            EventKind::GiverAdded => "GiverAdded(uint64,string)",
            EventKind::GiverUpdated => "GiverUpdated(uint64,string)",
            EventKind::DelegateAdded => "DelegateAdded(uint64,string)",
            EventKind::DelegateUpdated => "DelegateUpdated(uint64,string)",
            EventKind::ProjectAdded => "ProjectAdded(uint64,string)",
            EventKind::ProjectUpdated => "ProjectUpdated(uint64,string)",
            EventKind::AuthorizePayment => {
                "AuthorizePayment(uint256,bytes32,address,address,uint256)"
            }
            EventKind::SetApp => "SetApp(bytes32,bytes32,address)",
            EventKind::RequestReview => "RequestReview(address,uint64)",
            EventKind::ApproveCompleted => "ApproveCompleted(address,uint64)",
            EventKind::RejectCompleted => "RejectCompleted(address,uint64)",
            EventKind::ReviewerChanged => "ReviewerChanged(address,uint64,address)",
            EventKind::RecipientChanged => "RecipientChanged(address,uint64,address)",
            EventKind::PaymentCollected => "PaymentCollected(address,uint64)",
        }
    }

    pub fn topic(&self) -> H256 {
        H256(keccak256(self.signature()))
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        EventKind::iter().find(|kind| kind.topic() == *topic)
    }
}

/// Decoded chain event. Pledge id `0` on the wire becomes `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum LedgerEvent {
    Transfer {
        from: Option<PledgeId>,
        to: PledgeId,
        amount: U256,
    },
    CancelProject {
        project: AdminId,
    },
    GiverAdded {
        giver: AdminId,
    },
    GiverUpdated {
        giver: AdminId,
    },
    DelegateAdded {
        delegate: AdminId,
    },
    DelegateUpdated {
        delegate: AdminId,
    },
    ProjectAdded {
        project: AdminId,
    },
    ProjectUpdated {
        project: AdminId,
    },
    AuthorizePayment {
        payment_id: U256,
        reference: H256,
        dest: Address,
        token: Address,
        amount: U256,
    },
    SetApp {
        namespace: H256,
        app_id: H256,
        app: Address,
    },
    RequestReview {
        project: AdminId,
    },
    ApproveCompleted {
        project: AdminId,
    },
    RejectCompleted {
        project: AdminId,
    },
    ReviewerChanged {
        project: AdminId,
        reviewer: Address,
    },
    RecipientChanged {
        project: AdminId,
        recipient: Address,
    },
    PaymentCollected {
        project: AdminId,
    },
    Unknown {
        signature: H256,
    },
}

impl LedgerEvent {
    pub fn decode(topics: &[H256], data: &[u8]) -> LedgerResult<Self> {
        let signature = topics
            .first()
            .ok_or_else(|| LedgerError::Decode("log without topics".into()))?;
        let Some(kind) = EventKind::from_topic(signature) else {
            return Ok(LedgerEvent::Unknown {
                signature: *signature,
            });
        };
        let event = match kind {
            EventKind::Transfer => {
                let amount = decode_data(data, &[ParamType::Uint(256)])?;
                let to = topic_u64(topics, 2)?;
                LedgerEvent::Transfer {
                    from: PledgeId::new(topic_u64(topics, 1)?),
                    to: PledgeId::new(to).ok_or_else(|| {
                        LedgerError::Decode("transfer into pledge 0".into())
                    })?,
                    amount: token_uint(&amount[0])?,
                }
            }
            EventKind::CancelProject => LedgerEvent::CancelProject {
                project: topic_u64(topics, 1)?,
            },
            EventKind::GiverAdded => LedgerEvent::GiverAdded {
                giver: topic_u64(topics, 1)?,
            },
            EventKind::GiverUpdated => LedgerEvent::GiverUpdated {
                giver: topic_u64(topics, 1)?,
            },
            EventKind::DelegateAdded => LedgerEvent::DelegateAdded {
                delegate: topic_u64(topics, 1)?,
            },
            EventKind::DelegateUpdated => LedgerEvent::DelegateUpdated {
                delegate: topic_u64(topics, 1)?,
            },
            EventKind::ProjectAdded => LedgerEvent::ProjectAdded {
                project: topic_u64(topics, 1)?,
            },
            EventKind::ProjectUpdated => LedgerEvent::ProjectUpdated {
                project: topic_u64(topics, 1)?,
            },
            EventKind::AuthorizePayment => {
                let tokens = decode_data(data, &[ParamType::Address, ParamType::Uint(256)])?;
                LedgerEvent::AuthorizePayment {
                    payment_id: U256::from_big_endian(topic(topics, 1)?.as_bytes()),
                    reference: topic(topics, 2)?,
                    dest: topic_address(topics, 3)?,
                    token: token_address(&tokens[0])?,
                    amount: token_uint(&tokens[1])?,
                }
            }
            EventKind::SetApp => {
                let tokens = decode_data(data, &[ParamType::Address])?;
                LedgerEvent::SetApp {
                    namespace: topic(topics, 1)?,
                    app_id: topic(topics, 2)?,
                    app: token_address(&tokens[0])?,
                }
            }
            EventKind::RequestReview => LedgerEvent::RequestReview {
                project: topic_u64(topics, 2)?,
            },
            EventKind::ApproveCompleted => LedgerEvent::ApproveCompleted {
                project: topic_u64(topics, 2)?,
            },
            EventKind::RejectCompleted => LedgerEvent::RejectCompleted {
                project: topic_u64(topics, 2)?,
            },
            EventKind::ReviewerChanged => {
                let tokens = decode_data(data, &[ParamType::Address])?;
                LedgerEvent::ReviewerChanged {
                    project: topic_u64(topics, 2)?,
                    reviewer: token_address(&tokens[0])?,
                }
            }
            EventKind::RecipientChanged => {
                let tokens = decode_data(data, &[ParamType::Address])?;
                LedgerEvent::RecipientChanged {
                    project: topic_u64(topics, 2)?,
                    recipient: token_address(&tokens[0])?,
                }
            }
            EventKind::PaymentCollected => LedgerEvent::PaymentCollected {
                project: topic_u64(topics, 2)?,
            },
        };
        Ok(event)
    }

    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            LedgerEvent::Transfer { .. } => EventKind::Transfer,
            LedgerEvent::CancelProject { .. } => EventKind::CancelProject,
            LedgerEvent::GiverAdded { .. } => EventKind::GiverAdded,
            LedgerEvent::GiverUpdated { .. } => EventKind::GiverUpdated,
            LedgerEvent::DelegateAdded { .. } => EventKind::DelegateAdded,
            LedgerEvent::DelegateUpdated { .. } => EventKind::DelegateUpdated,
            LedgerEvent::ProjectAdded { .. } => EventKind::ProjectAdded,
            LedgerEvent::ProjectUpdated { .. } => EventKind::ProjectUpdated,
            LedgerEvent::AuthorizePayment { .. } => EventKind::AuthorizePayment,
            LedgerEvent::SetApp { .. } => EventKind::SetApp,
            LedgerEvent::RequestReview { .. } => EventKind::RequestReview,
            LedgerEvent::ApproveCompleted { .. } => EventKind::ApproveCompleted,
            LedgerEvent::RejectCompleted { .. } => EventKind::RejectCompleted,
            LedgerEvent::ReviewerChanged { .. } => EventKind::ReviewerChanged,
            LedgerEvent::RecipientChanged { .. } => EventKind::RecipientChanged,
            LedgerEvent::PaymentCollected { .. } => EventKind::PaymentCollected,
            LedgerEvent::Unknown { .. } => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> String {
        self.kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn return_values(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Stable identity of a log across duplicate deliveries and shallow reorgs.
/// Block position is deliberately left out so a re-mined log keeps its id.
pub fn event_identity(log: &RawLog) -> H256 {
    let mut preimage = Vec::with_capacity(20 + 32 * (log.topics.len() + 2) + log.data.len());
    preimage.extend_from_slice(log.address.as_bytes());
    if let Some(signature) = log.topics.first() {
        preimage.extend_from_slice(signature.as_bytes());
    }
    preimage.extend_from_slice(log.transaction_hash.as_bytes());
    for topic in &log.topics {
        preimage.extend_from_slice(topic.as_bytes());
    }
    preimage.extend_from_slice(&log.data);
    if let Some(index) = log.transaction_log_index {
        preimage.extend_from_slice(&index.to_be_bytes());
    }
    H256(keccak256(preimage))
}

/// Payment references carry the pledge id in their low 8 bytes.
pub fn pledge_from_reference(reference: &H256) -> Option<PledgeId> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&reference.as_bytes()[24..]);
    PledgeId::new(u64::from_be_bytes(raw))
}

fn topic(topics: &[H256], index: usize) -> LedgerResult<H256> {
    topics
        .get(index)
        .copied()
        .ok_or_else(|| LedgerError::Decode(format!("missing topic {}", index)))
}

fn topic_u64(topics: &[H256], index: usize) -> LedgerResult<u64> {
    let value = U256::from_big_endian(topic(topics, index)?.as_bytes());
    if value > U256::from(u64::MAX) {
        return Err(LedgerError::Decode(format!(
            "topic {} does not fit in uint64: {}",
            index, value
        )));
    }
    Ok(value.as_u64())
}

fn topic_address(topics: &[H256], index: usize) -> LedgerResult<Address> {
    Ok(Address::from_slice(&topic(topics, index)?.as_bytes()[12..]))
}

fn decode_data(data: &[u8], params: &[ParamType]) -> LedgerResult<Vec<Token>> {
    Ok(ethers::abi::decode(params, data)?)
}

fn token_uint(token: &Token) -> LedgerResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| LedgerError::Decode(format!("expected uint, got {:?}", token)))
}

fn token_address(token: &Token) -> LedgerResult<Address> {
    token
        .clone()
        .into_address()
        .ok_or_else(|| LedgerError::Decode(format!("expected address, got {:?}", token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{raw_log, transfer_log, u64_topic};

    #[test]
    fn test_decode_transfer_from_root() {
        let log = transfer_log(0, 5, 1000, H256::repeat_byte(0xa), 1, 0);
        let event = LedgerEvent::decode(&log.topics, &log.data).unwrap();
        assert_eq!(
            event,
            LedgerEvent::Transfer {
                from: None,
                to: PledgeId::new(5).unwrap(),
                amount: U256::from(1000),
            }
        );
        assert_eq!(event.name(), "Transfer");
        assert_eq!(event.return_values()["event"], "Transfer");
    }

    #[test]
    fn test_decode_milestone_event_uses_second_topic() {
        let log = raw_log(
            EventKind::ReviewerChanged,
            vec![H256::from(Address::repeat_byte(1)), u64_topic(42)],
            ethers::abi::encode(&[Token::Address(Address::repeat_byte(9))]),
            H256::repeat_byte(1),
            1,
            0,
        );
        assert_eq!(
            LedgerEvent::decode(&log.topics, &log.data).unwrap(),
            LedgerEvent::ReviewerChanged {
                project: 42,
                reviewer: Address::repeat_byte(9)
            }
        );
    }

    #[test]
    fn test_unknown_signature_is_preserved() {
        let signature = H256::repeat_byte(0xee);
        let event = LedgerEvent::decode(&[signature], &[]).unwrap();
        assert_eq!(event, LedgerEvent::Unknown { signature });
        assert_eq!(event.kind(), None);
        assert_eq!(event.name(), "Unknown");
    }

    #[test]
    fn test_oversized_pledge_id_is_rejected() {
        let mut log = transfer_log(1, 2, 10, H256::zero(), 1, 0);
        log.topics[2] = H256::repeat_byte(0xff);
        assert!(matches!(
            LedgerEvent::decode(&log.topics, &log.data),
            Err(LedgerError::Decode(_))
        ));
    }

    #[test]
    fn test_identity_ignores_block_position() {
        let log = transfer_log(1, 2, 10, H256::repeat_byte(3), 10, 4);
        let mut moved = log.clone();
        moved.block_number = 11;
        moved.log_index = 0;
        moved.block_hash = H256::repeat_byte(0x77);
        assert_eq!(event_identity(&log), event_identity(&moved));

        let mut other_amount = log.clone();
        other_amount.data = ethers::abi::encode(&[Token::Uint(U256::from(11))]).into();
        assert_ne!(event_identity(&log), event_identity(&other_amount));
    }

    #[test]
    fn test_pledge_from_reference() {
        let mut reference = [0u8; 32];
        reference[31] = 7;
        assert_eq!(
            pledge_from_reference(&H256(reference)),
            PledgeId::new(7)
        );
        assert_eq!(pledge_from_reference(&H256::zero()), None);
    }
}
