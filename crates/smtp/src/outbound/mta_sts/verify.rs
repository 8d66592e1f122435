/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use super::{Mode, MxPattern, Policy};

impl Policy {
    /// Whether `mx_host` is authorized by this policy. Wildcard patterns
    /// match exactly one leftmost label.
    pub fn verify(&self, mx_host: &str) -> bool {
        if self.mode != Mode::None {
            let mx_host = mx_host.strip_suffix('.').unwrap_or(mx_host);
            for pattern in &self.mx {
                match pattern {
                    MxPattern::Equals(host) => {
                        if host == mx_host {
                            return true;
                        }
                    }
                    MxPattern::StartsWith(suffix) => {
                        if let Some((label, domain)) = mx_host.split_once('.') {
                            if domain == suffix && !label.is_empty() {
                                return true;
                            }
                        }
                    }
                }
            }
            false
        } else {
            true
        }
    }

    pub fn enforce(&self) -> bool {
        self.mode == Mode::Enforce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: Mode) -> Policy {
        Policy {
            id: "1".to_string(),
            mode,
            mx: vec![
                MxPattern::Equals("mx.e.example".to_string()),
                MxPattern::StartsWith("pool.e.example".to_string()),
            ],
            max_age: 86400,
        }
    }

    #[test]
    fn mx_matching() {
        let policy = policy(Mode::Enforce);
        assert!(policy.verify("mx.e.example"));
        assert!(policy.verify("mx.e.example."));
        assert!(policy.verify("a.pool.e.example"));
        assert!(!policy.verify("other.e.example"));
        assert!(!policy.verify("deep.a.pool.e.example"));
        assert!(policy.enforce());
    }

    #[test]
    fn mode_none_matches_everything() {
        assert!(policy(Mode::None).verify("anything.example"));
        assert!(!policy(Mode::Testing).verify("other.e.example"));
        assert!(!policy(Mode::Testing).enforce());
    }
}
