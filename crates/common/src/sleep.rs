/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use crate::Shutdown;

/// Sleep for `duration`, returning early when the process starts shutting
/// down. Used where a sleep pushes back on clients.
pub async fn sleep(shutdown: &Shutdown, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => (),
        _ = shutdown.wait() => (),
    }
}
