// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::LedgerResult;
use crate::types::{AdminType, DonationStatus, Pledge, PledgeState};

/// Donation status implied by the pledge a donation sits at and the type of
/// the pledge's owning admin. An unrecognized pledge state is an error.
pub fn derive_status(pledge: &Pledge, owner_type: AdminType) -> LedgerResult<DonationStatus> {
    let status = match pledge.state()? {
        PledgeState::Paying => DonationStatus::Paying,
        PledgeState::Paid => DonationStatus::Paid,
        PledgeState::Pledged if pledge.intended_project.is_some() => DonationStatus::ToApprove,
        PledgeState::Pledged if owner_type == AdminType::Giver || !pledge.delegates.is_empty() => {
            DonationStatus::Waiting
        }
        PledgeState::Pledged => DonationStatus::Committed,
    };
    Ok(status)
}
