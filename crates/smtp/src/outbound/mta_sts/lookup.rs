/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use auth::{mta_sts::MtaStsRecord, DnsError};

use crate::core::SMTP;

use super::{Error, Policy};

#[cfg(feature = "test_mode")]
pub static STS_TEST_POLICY: parking_lot::Mutex<Vec<u8>> = parking_lot::Mutex::new(Vec::new());

impl SMTP {
    /// Resolves the MTA-STS policy for `domain`: TXT record first, then the
    /// well-known HTTPS endpoint on id change or cache miss. Policies are
    /// served from cache for at most `max_age`.
    pub async fn lookup_mta_sts_policy(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<Arc<Policy>, Error> {
        let record = match self
            .core
            .resolver
            .txt_lookup(&format!("_mta-sts.{domain}"))
            .await
            .and_then(|records| {
                MtaStsRecord::from_txt(&records)
                    .map_err(|err| DnsError::Permanent(err.0))?
                    .ok_or(DnsError::NotFound)
            }) {
            Ok(record) => record,
            Err(err) => {
                // Serve the cached policy while the record is unreachable.
                return if let Some(policy) = self.mta_sts_cache.get(domain) {
                    Ok(policy)
                } else {
                    Err(err.into())
                };
            }
        };

        if let Some(policy) = self.mta_sts_cache.get(domain) {
            if policy.id == record.id {
                return Ok(policy);
            }
        }

        // Fetch the policy file.
        #[cfg(not(feature = "test_mode"))]
        let bytes = reqwest::Client::builder()
            .user_agent(common::USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?
            .get(format!("https://mta-sts.{domain}/.well-known/mta-sts.txt"))
            .send()
            .await?
            .bytes()
            .await?;
        #[cfg(feature = "test_mode")]
        let bytes = {
            let _ = timeout;
            STS_TEST_POLICY.lock().clone()
        };

        let policy = Policy::parse(
            std::str::from_utf8(&bytes)
                .map_err(|err| Error::InvalidPolicy(err.to_string()))?,
            record.id.clone(),
        )
        .map_err(Error::InvalidPolicy)?;

        // Clamp unreasonable max_age values before caching.
        let valid_until = Instant::now()
            + Duration::from_secs(if (3600..31557600).contains(&policy.max_age) {
                policy.max_age
            } else {
                86400
            });

        Ok(self
            .mta_sts_cache
            .insert(domain.to_string(), Arc::new(policy), valid_until))
    }
}
