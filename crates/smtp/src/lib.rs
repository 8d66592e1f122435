/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::SMTP;

pub mod core;
pub mod inbound;
pub mod outbound;
pub mod queue;
pub mod reporting;

/// Starts the queue manager and the report scheduler on their own tasks.
pub trait SpawnServices {
    fn spawn_services(
        self,
        queue_rx: mpsc::Receiver<queue::Event>,
        report_rx: mpsc::Receiver<reporting::Event>,
    );
}

impl SpawnServices for Arc<SMTP> {
    fn spawn_services(
        self,
        queue_rx: mpsc::Receiver<queue::Event>,
        report_rx: mpsc::Receiver<reporting::Event>,
    ) {
        let core = self.clone();
        tokio::spawn(async move {
            queue::manager::Queue::new(core, queue_rx).run().await;
        });
        tokio::spawn(async move {
            reporting::scheduler::Scheduler::new(self, report_rx).run().await;
        });
    }
}
