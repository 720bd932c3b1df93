//! Test harness: in-memory stores plus a scripted step executor.
//!
//! Fakes only the executor; the ledger, lead store, catalog, journal and
//! notification backend are the real in-memory implementations.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;

use outreach_common::{
    ActionKind, Company, EngagementSequence, Enrollment, Lead, LeadTemperature, SequenceStep,
};
use outreach_sequencer::ledger::CreditLedger;
use outreach_sequencer::leads::LeadStore;
use outreach_sequencer::{
    ExecutionResult, MemoryDeps, SchedulerConfig, Sequencer, StepContext, StepExecutor,
};

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Return(ExecutionResult),
    /// Sleep, then return.
    Delay(Duration, ExecutionResult),
    /// Never return.
    Hang,
}

/// Plays back scripted results in call order; succeeds once the script runs out.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<StepContext>>,
    started: Notify,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn push_many(&self, steps: impl IntoIterator<Item = Scripted>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub fn calls(&self) -> Vec<StepContext> {
        self.calls.lock().unwrap().clone()
    }

    /// Resolves once an execution has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        _action_kind: ActionKind,
        _payload: &serde_json::Value,
    ) -> ExecutionResult {
        self.calls.lock().unwrap().push(ctx.clone());
        let next = self.script.lock().unwrap().pop_front();
        self.started.notify_one();

        match next {
            None => ExecutionResult::Success,
            Some(Scripted::Return(result)) => result,
            Some(Scripted::Delay(delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            Some(Scripted::Hang) => std::future::pending().await,
        }
    }
}

pub fn retryable(reason: &str) -> Scripted {
    Scripted::Return(ExecutionResult::RetryableFailure(reason.to_string()))
}

pub fn fatal(reason: &str) -> Scripted {
    Scripted::Return(ExecutionResult::FatalFailure(reason.to_string()))
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

pub fn message(position: u32, delay_secs: u64) -> SequenceStep {
    SequenceStep::new(
        position,
        ActionKind::SendMessage,
        delay_secs,
        json!({"channel": "email", "subject": "Hello", "body": "Checking in"}),
    )
}

pub fn wait_for_reply(position: u32, delay_secs: u64) -> SequenceStep {
    SequenceStep::new(position, ActionKind::WaitForReply, delay_secs, json!({}))
}

pub struct Harness {
    pub mem: MemoryDeps,
    pub executor: Arc<ScriptedExecutor>,
    pub sequencer: Sequencer,
    pub company: Company,
}

impl Harness {
    pub async fn new(credits: u64) -> Self {
        Self::with_config(credits, SchedulerConfig::default()).await
    }

    pub async fn with_config(credits: u64, config: SchedulerConfig) -> Self {
        let mem = MemoryDeps::new();
        let executor = ScriptedExecutor::new();
        let sequencer = Sequencer::new(mem.with_executor(executor.clone()), config);

        let company = Company::new("Acme Outreach", credits);
        sequencer.open_company(&company).await.unwrap();

        Self {
            mem,
            executor,
            sequencer,
            company,
        }
    }

    pub async fn lead(&self) -> Lead {
        let lead = Lead::new(self.company.id, LeadTemperature::Warm);
        self.sequencer.register_lead(&lead).await.unwrap();
        lead
    }

    pub async fn sequence(&self, steps: Vec<SequenceStep>) -> EngagementSequence {
        let sequence = EngagementSequence::new(self.company.id, steps).unwrap();
        self.sequencer.publish_sequence(sequence).await.unwrap()
    }

    /// A fresh lead enrolled at `now` in `sequence`.
    pub async fn enrolled(&self, sequence: &EngagementSequence, now: DateTime<Utc>) -> Enrollment {
        let lead = self.lead().await;
        self.sequencer.enroll(lead.id, sequence.id, now).await.unwrap()
    }

    pub async fn get(&self, enrollment: &Enrollment) -> Enrollment {
        self.mem
            .leads
            .enrollment(enrollment.id)
            .await
            .unwrap()
            .expect("enrollment exists")
    }

    pub async fn balance(&self) -> u64 {
        self.mem.ledger.balance(self.company.id).await.unwrap()
    }

    pub async fn debits(&self) -> usize {
        self.mem
            .ledger
            .transactions(self.company.id)
            .await
            .unwrap()
            .iter()
            .filter(|t| t.amount < 0)
            .count()
    }
}
