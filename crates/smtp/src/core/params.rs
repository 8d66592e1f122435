/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use common::config::{Rate, ServerProtocol, SessionConfig, VerifyStrategy};

/// Session limits and verification strategies resolved once per connection.
#[derive(Clone)]
pub struct SessionParameters {
    pub timeout: Duration,
    pub max_message_size: usize,
    pub max_rcpt: usize,
    pub max_messages: usize,
    pub max_received_headers: usize,
    pub ehlo_require: bool,
    pub ehlo_reject_non_fqdn: bool,
    pub auth_require: bool,
    pub auth_match_sender: bool,
    pub auth_rate: Rate,
    pub bad_command_limit: u64,
    pub spf_ehlo: VerifyStrategy,
    pub spf_mail_from: VerifyStrategy,
    pub iprev: VerifyStrategy,
    pub dkim: VerifyStrategy,
    pub dmarc: VerifyStrategy,
    pub first_time_sender_delay: Option<Duration>,
}

impl SessionParameters {
    pub fn resolve(config: &SessionConfig, protocol: ServerProtocol) -> Self {
        let is_submission = protocol == ServerProtocol::Submission;
        SessionParameters {
            timeout: config.timeout,
            max_message_size: config.max_message_size,
            max_rcpt: config.max_rcpt,
            max_messages: config.max_messages,
            max_received_headers: config.max_received_headers,
            ehlo_require: config.ehlo_require,
            ehlo_reject_non_fqdn: config.ehlo_reject_non_fqdn && !is_submission,
            auth_require: config.auth_require || is_submission,
            auth_match_sender: config.auth_match_sender,
            auth_rate: config.auth_rate,
            bad_command_limit: config.bad_command_limit,
            // Submitted mail is authenticated, not policy-checked.
            spf_ehlo: strategy(config.spf_ehlo, is_submission),
            spf_mail_from: strategy(config.spf_mail_from, is_submission),
            iprev: strategy(config.iprev, is_submission),
            dkim: strategy(config.dkim, is_submission),
            dmarc: strategy(config.dmarc, is_submission),
            first_time_sender_delay: config.first_time_sender_delay,
        }
    }
}

fn strategy(configured: VerifyStrategy, is_submission: bool) -> VerifyStrategy {
    if is_submission {
        VerifyStrategy::Disable
    } else {
        configured
    }
}
