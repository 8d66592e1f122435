/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use crate::{
    dkim::DkimOutput,
    spf::{SpfOutput, SpfResult},
    suffixlist::PublicSuffix,
    trim_dot, DnsError, Lookup,
};

use super::{Alignment, AlignmentMode, Dmarc, DmarcOutput, DmarcResult, Policy};

/// Full DMARC evaluation: record discovery with organizational-domain
/// fallback, identifier alignment, policy application with `pct=` sampling.
/// `sample_seed` keeps sampling reproducible within one connection.
pub async fn verify_dmarc(
    resolver: &impl Lookup,
    psl: &PublicSuffix,
    from_domain: &str,
    dkim: &[DkimOutput],
    spf: Option<&SpfOutput>,
    sample_seed: u64,
) -> DmarcOutput {
    let from_domain = trim_dot(from_domain).to_lowercase();
    let org_domain = psl.org_domain(&from_domain);

    // Discover the record, falling back to the organizational domain.
    let mut record = None;
    let mut record_domain = from_domain.clone();
    let mut is_subdomain = false;
    let mut lookup_error = None;
    match fetch_record(resolver, &from_domain).await {
        Ok(found) => record = found,
        Err(err) => lookup_error = Some(err),
    }
    if record.is_none() && org_domain != from_domain {
        match fetch_record(resolver, &org_domain).await {
            Ok(Some(found)) => {
                record = Some(found);
                record_domain = org_domain.clone();
                is_subdomain = true;
                lookup_error = None;
            }
            Ok(None) => (),
            Err(err) => {
                if lookup_error.is_none() {
                    lookup_error = Some(err);
                }
            }
        }
    }

    // Identifier alignment is computed regardless of the record so that
    // reputation tracking can use it.
    let dkim_alignment = dkim
        .iter()
        .filter(|output| output.is_pass())
        .filter_map(|output| output.signature())
        .map(|signature| align(psl, &from_domain, &org_domain, &signature.domain))
        .max()
        .unwrap_or(Alignment::None);
    let spf_alignment = match spf {
        Some(output) if output.result() == SpfResult::Pass => {
            align(psl, &from_domain, &org_domain, &output.domain)
        }
        _ => Alignment::None,
    };
    let alignment = dkim_alignment.max(spf_alignment);

    let record = match record {
        Some(record) => record,
        None => {
            let result = match lookup_error {
                Some(DnsError::Temporary(err)) => DmarcResult::TempError(err),
                Some(DnsError::Permanent(err)) => DmarcResult::PermError(err),
                _ => DmarcResult::None,
            };
            return DmarcOutput {
                record: None,
                domain: record_domain,
                result: result.clone(),
                dkim_result: result.clone(),
                spf_result: result,
                policy: Policy::None,
                alignment,
            };
        }
    };

    let dkim_result = identifier_result(
        dkim_alignment,
        record.adkim,
        dkim.iter().any(|output| {
            matches!(output.result(), crate::dkim::DkimResult::TempError(_))
        }),
    );
    let spf_result = match spf.map(|output| output.result()) {
        Some(SpfResult::TempError) => DmarcResult::TempError("SPF temperror".to_string()),
        _ => identifier_result(spf_alignment, record.aspf, false),
    };

    // A single aligned pass carries the evaluation; a temperror on either
    // leg only matters when nothing passed.
    let result = if dkim_result == DmarcResult::Pass || spf_result == DmarcResult::Pass {
        DmarcResult::Pass
    } else if let DmarcResult::TempError(err) = &spf_result {
        DmarcResult::TempError(err.clone())
    } else if let DmarcResult::TempError(err) = &dkim_result {
        DmarcResult::TempError(err.clone())
    } else {
        DmarcResult::Fail
    };

    // pct= sampling; a message outside the sample gets the next weaker
    // disposition.
    let mut policy = record.effective_policy(is_subdomain);
    if result != DmarcResult::Pass
        && record.pct < 100
        && (sample_seed % 100) >= record.pct as u64
    {
        policy = match policy {
            Policy::Reject => Policy::Quarantine,
            _ => Policy::None,
        };
    }

    DmarcOutput {
        record: Some(Arc::new(record)),
        domain: record_domain,
        result,
        dkim_result,
        spf_result,
        policy,
        alignment,
    }
}

/// Checks the opt-in record allowing `dest_domain` to receive reports about
/// `origin_domain`: `<origin>._report._dmarc.<dest>` per RFC 7489 §7.1.
pub async fn verify_external_report_address(
    resolver: &impl Lookup,
    origin_domain: &str,
    dest_address: &str,
) -> bool {
    let dest_domain = dest_address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or(dest_address);
    if dest_domain.eq_ignore_ascii_case(origin_domain) {
        return true;
    }
    match resolver
        .txt(&format!("{origin_domain}._report._dmarc.{dest_domain}"))
        .await
    {
        Ok(records) => records.iter().any(|record| {
            record
                .split(';')
                .next()
                .map_or(false, |v| v.trim().eq_ignore_ascii_case("v=DMARC1"))
        }),
        Err(_) => false,
    }
}

async fn fetch_record(
    resolver: &impl Lookup,
    domain: &str,
) -> Result<Option<Dmarc>, DnsError> {
    match resolver.txt(&format!("_dmarc.{domain}")).await {
        Ok(records) => Ok(Dmarc::from_txt(&records).unwrap_or(None)),
        Err(DnsError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

fn align(psl: &PublicSuffix, from_domain: &str, from_org: &str, identity: &str) -> Alignment {
    let identity = trim_dot(identity).to_lowercase();
    if identity == from_domain {
        Alignment::Strict
    } else if psl.org_domain(&identity) == from_org {
        Alignment::Relaxed
    } else {
        Alignment::None
    }
}

fn identifier_result(alignment: Alignment, mode: AlignmentMode, temp_error: bool) -> DmarcResult {
    match (alignment, mode) {
        (Alignment::Strict, _) => DmarcResult::Pass,
        (Alignment::Relaxed, AlignmentMode::Relaxed) => DmarcResult::Pass,
        _ if temp_error => DmarcResult::TempError("identifier evaluation failed".to_string()),
        _ => DmarcResult::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dkim::{DkimOutput, DkimResult, Signature},
        spf::{SpfIdentity, SpfOutput},
        test_support::TestLookup,
    };

    fn dkim_pass(domain: &str) -> DkimOutput {
        DkimOutput {
            result: DkimResult::Pass,
            signature: Some(Signature {
                algorithm: crate::dkim::Algorithm::Ed25519Sha256,
                domain: domain.to_string(),
                selector: "s1".to_string(),
                header_canon: Default::default(),
                body_canon: Default::default(),
                headers: vec!["from".to_string()],
                body_hash: Vec::new(),
                signature: Vec::new(),
                timestamp: 0,
                expiration: 0,
                identity: None,
                body_length: None,
            }),
        }
    }

    fn spf_pass(domain: &str) -> SpfOutput {
        SpfOutput {
            result: SpfResult::Pass,
            domain: domain.to_string(),
            identity: SpfIdentity::MailFrom,
            explanation: None,
            report: None,
        }
    }

    fn spf_result(domain: &str, result: SpfResult) -> SpfOutput {
        SpfOutput {
            result,
            ..spf_pass(domain)
        }
    }

    async fn eval(
        resolver: &TestLookup,
        from: &str,
        dkim: &[DkimOutput],
        spf: Option<&SpfOutput>,
    ) -> DmarcOutput {
        verify_dmarc(resolver, &PublicSuffix::builtin(), from, dkim, spf, 0).await
    }

    #[tokio::test]
    async fn dkim_only_aligned_passes() {
        let resolver = TestLookup::new().txt("_dmarc.d.example", &["v=DMARC1; p=reject"]);
        let output = eval(
            &resolver,
            "d.example",
            &[dkim_pass("d.example")],
            Some(&spf_result("other.example", SpfResult::None)),
        )
        .await;
        assert_eq!(output.result, DmarcResult::Pass);
        assert_eq!(output.alignment, Alignment::Strict);
        assert_eq!(output.dkim_result, DmarcResult::Pass);
        assert_eq!(output.spf_result, DmarcResult::Fail);
    }

    #[tokio::test]
    async fn reject_on_unaligned() {
        let resolver = TestLookup::new().txt("_dmarc.c.example", &["v=DMARC1; p=reject"]);
        let output = eval(
            &resolver,
            "c.example",
            &[],
            Some(&spf_result("c.example", SpfResult::Fail)),
        )
        .await;
        assert_eq!(output.result, DmarcResult::Fail);
        assert_eq!(output.policy, Policy::Reject);
    }

    #[tokio::test]
    async fn org_domain_fallback_uses_subdomain_policy() {
        let resolver =
            TestLookup::new().txt("_dmarc.example.com", &["v=DMARC1; p=reject; sp=quarantine"]);
        let output = eval(&resolver, "mail.example.com", &[], None).await;
        assert_eq!(output.domain, "example.com");
        assert_eq!(output.policy, Policy::Quarantine);
    }

    #[tokio::test]
    async fn relaxed_alignment_across_org_domain() {
        let resolver = TestLookup::new().txt("_dmarc.example.com", &["v=DMARC1; p=reject"]);
        let output = eval(
            &resolver,
            "mail.example.com",
            &[dkim_pass("other.example.com")],
            None,
        )
        .await;
        assert_eq!(output.result, DmarcResult::Pass);
        assert_eq!(output.alignment, Alignment::Relaxed);
    }

    #[tokio::test]
    async fn strict_mode_rejects_relaxed_alignment() {
        let resolver =
            TestLookup::new().txt("_dmarc.example.com", &["v=DMARC1; p=reject; adkim=s"]);
        let output = eval(
            &resolver,
            "example.com",
            &[dkim_pass("sub.example.com")],
            None,
        )
        .await;
        assert_eq!(output.result, DmarcResult::Fail);
        // Alignment itself is still relaxed, the mode rejected it.
        assert_eq!(output.alignment, Alignment::Relaxed);
    }

    #[tokio::test]
    async fn pct_sampling_downgrades() {
        let resolver =
            TestLookup::new().txt("_dmarc.c.example", &["v=DMARC1; p=reject; pct=0"]);
        let output = eval(&resolver, "c.example", &[], None).await;
        assert_eq!(output.result, DmarcResult::Fail);
        assert_eq!(output.policy, Policy::Quarantine);
    }

    #[tokio::test]
    async fn spf_temperror_yields_temperror_unless_dkim_aligns() {
        let resolver = TestLookup::new().txt("_dmarc.c.example", &["v=DMARC1; p=reject"]);
        let output = eval(
            &resolver,
            "c.example",
            &[],
            Some(&spf_result("c.example", SpfResult::TempError)),
        )
        .await;
        assert!(matches!(output.result, DmarcResult::TempError(_)));

        let output = eval(
            &resolver,
            "c.example",
            &[dkim_pass("c.example")],
            Some(&spf_result("c.example", SpfResult::TempError)),
        )
        .await;
        assert_eq!(output.result, DmarcResult::Pass);
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let output = eval(&TestLookup::new(), "c.example", &[], None).await;
        assert_eq!(output.result, DmarcResult::None);
        assert_eq!(output.policy, Policy::None);
    }

    #[tokio::test]
    async fn external_report_address_requires_opt_in() {
        let resolver = TestLookup::new().txt(
            "c.example._report._dmarc.reports.example",
            &["v=DMARC1"],
        );
        assert!(
            verify_external_report_address(&resolver, "c.example", "agg@reports.example").await
        );
        assert!(
            !verify_external_report_address(&resolver, "c.example", "agg@other.example").await
        );
        assert!(verify_external_report_address(&resolver, "c.example", "agg@c.example").await);
    }
}
