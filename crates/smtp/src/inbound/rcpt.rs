/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use smtp_proto::{RcptTo, RCPT_NOTIFY_DELAY, RCPT_NOTIFY_FAILURE, RCPT_NOTIFY_NEVER, RCPT_NOTIFY_SUCCESS};

use crate::core::{Session, SessionAddress};

impl<T: SessionStream> Session<T> {
    pub async fn handle_rcpt_to(&mut self, to: RcptTo<String>) -> Result<(), ()> {
        if self.data.mail_from.is_none() {
            return self.write(b"503 5.5.1 MAIL is required first.\r\n").await;
        } else if self.data.rcpt_to.len() >= self.params.max_rcpt {
            return self
                .write(b"451 4.5.3 Too many recipients.\r\n")
                .await;
        }

        if !to.address.is_ascii()
            && self
                .data
                .mail_from
                .as_ref()
                .map_or(true, |m| (m.flags & smtp_proto::MAIL_SMTPUTF8) == 0)
        {
            return self
                .write(b"553 5.6.7 SMTPUTF8 is required for non-ASCII addresses.\r\n")
                .await;
        }

        let mut rcpt = SessionAddress::new(to.address);
        rcpt.flags = if to.flags
            & (RCPT_NOTIFY_SUCCESS | RCPT_NOTIFY_FAILURE | RCPT_NOTIFY_DELAY | RCPT_NOTIFY_NEVER)
            != 0
        {
            to.flags
        } else {
            to.flags | RCPT_NOTIFY_DELAY | RCPT_NOTIFY_FAILURE
        };
        rcpt.dsn_info = to.orcpt;

        if self.data.rcpt_to.contains(&rcpt) {
            return self.write(b"250 2.1.5 OK\r\n").await;
        }

        // Authenticated submission relays anywhere; everyone else only
        // reaches local accounts.
        if self.data.authenticated_as.is_empty() {
            if !self.core.core.mail_auth.is_local_domain(&rcpt.domain) {
                self.data.bad_commands += 1;
                return self
                    .write(b"551 5.7.1 Relaying not allowed.\r\n")
                    .await;
            }
            if self
                .core
                .core
                .store
                .open_account(&rcpt.address_lcase)
                .await
                .is_none()
            {
                return self
                    .write(b"550 5.1.1 Mailbox does not exist.\r\n")
                    .await;
            }
        }

        tracing::debug!(parent: &self.span,
            context = "rcpt-to",
            event = "success",
            address = rcpt.address.as_str());
        self.data.rcpt_to.push(rcpt);
        self.write(b"250 2.1.5 OK\r\n").await
    }
}
