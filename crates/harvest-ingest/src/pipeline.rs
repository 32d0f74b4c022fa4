//! Stage orchestration
//!
//! The users stage pages through every user and stores them. The bets stage
//! then walks stored users in id order, harvests qualifying users' bets in
//! parallel and writes them chunk by chunk, logging a resume label after
//! each chunk. The contracts and comments stages refresh markets and
//! comments for the users with the most stored bets, one user at a time.

use chrono::Utc;
use futures::StreamExt;
use harvest_common::types::{RawPayload, Subject};
use harvest_common::{HarvestError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::config::{BetsStageConfig, TopUsersStageConfig, UsersStageConfig};
use crate::harvester::{ChunkHarvest, ChunkedHarvester};
use crate::normalize::{
    prepare_records, BetNormalizer, CommentNormalizer, ContractNormalizer, Normalizer,
    UserNormalizer,
};
use crate::pagination::{CursorPaginator, Endpoint};
use crate::source::{stream_chunks, RankedSubject, RankedSubjects, SubjectStore};
use crate::writer::{AdaptiveWriter, RecordSink};

/// Which stages a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stages {
    /// Users, bets, contracts and comments, in that order
    #[default]
    All,
    UsersOnly,
    BetsOnly,
    ContractsOnly,
    CommentsOnly,
}

impl Stages {
    /// At most one `*_only` flag may be set
    pub fn from_flags(
        users_only: bool,
        bets_only: bool,
        contracts_only: bool,
        comments_only: bool,
    ) -> Result<Self> {
        let selected: Vec<Stages> = [
            (users_only, Stages::UsersOnly),
            (bets_only, Stages::BetsOnly),
            (contracts_only, Stages::ContractsOnly),
            (comments_only, Stages::CommentsOnly),
        ]
        .into_iter()
        .filter_map(|(set, stage)| set.then_some(stage))
        .collect();

        match selected.as_slice() {
            [] => Ok(Stages::All),
            [only] => Ok(*only),
            _ => Err(HarvestError::config(
                "use at most one of --users-only, --bets-only, --contracts-only or --comments-only",
            )),
        }
    }

    fn users(self) -> bool {
        matches!(self, Stages::All | Stages::UsersOnly)
    }

    fn bets(self) -> bool {
        matches!(self, Stages::All | Stages::BetsOnly)
    }

    fn contracts(self) -> bool {
        matches!(self, Stages::All | Stages::ContractsOnly)
    }

    fn comments(self) -> bool {
        matches!(self, Stages::All | Stages::CommentsOnly)
    }
}

/// Totals for one stage
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: &'static str,
    pub chunks: usize,
    pub subjects_scanned: usize,
    pub qualifying: usize,
    pub skipped: usize,
    pub failed: usize,
    pub payloads: usize,
    pub malformed: usize,
    pub rows_upserted: u64,
    pub dropped: usize,
    /// Last label of the last completed chunk
    pub last_label: Option<String>,
}

impl StageReport {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ..Default::default()
        }
    }
}

pub struct Pipeline<S> {
    client: ApiClient,
    store: S,
    users: UsersStageConfig,
    bets: BetsStageConfig,
    contracts: TopUsersStageConfig,
    comments: TopUsersStageConfig,
    cancel: CancellationToken,
}

impl<S> Pipeline<S>
where
    S: RecordSink + SubjectStore + RankedSubjects + Clone,
{
    /// Cancellation is taken from the client so every layer observes the
    /// same token. Contracts and comments start from their defaults.
    pub fn new(client: ApiClient, store: S, users: UsersStageConfig, bets: BetsStageConfig) -> Self {
        let cancel = client.cancellation().clone();
        Self {
            client,
            store,
            users,
            bets,
            contracts: TopUsersStageConfig::contracts(),
            comments: TopUsersStageConfig::comments(),
            cancel,
        }
    }

    pub fn with_contracts(mut self, contracts: TopUsersStageConfig) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_comments(mut self, comments: TopUsersStageConfig) -> Self {
        self.comments = comments;
        self
    }

    pub async fn run(&self, stages: Stages, start_username: Option<&str>) -> Result<Vec<StageReport>> {
        let mut reports = Vec::new();
        if stages.users() {
            reports.push(self.run_users().await?);
        }
        if stages.bets() {
            reports.push(self.run_bets(start_username).await?);
        }
        if stages.contracts() {
            reports.push(self.run_contracts().await?);
        }
        if stages.comments() {
            reports.push(self.run_comments().await?);
        }
        Ok(reports)
    }

    async fn write_payloads<N: Normalizer>(
        &self,
        normalizer: &N,
        writer: &AdaptiveWriter<S>,
        payloads: &[RawPayload],
        report: &mut StageReport,
    ) -> Result<()> {
        let prepared = prepare_records(normalizer, payloads, Utc::now());
        report.malformed += prepared.skipped;

        let written = writer.upsert(normalizer.table(), prepared.records).await?;
        report.rows_upserted += written.rows_affected;
        report.dropped += written.dropped.len();
        Ok(())
    }

    /// Page through `/users`, writing every `chunk_size` users
    pub async fn run_users(&self) -> Result<StageReport> {
        let cfg = &self.users;
        let mut report = StageReport::new("users");
        let normalizer = UserNormalizer::new();
        let writer = AdaptiveWriter::new(self.store.clone(), cfg.max_params_per_statement)
            .with_cancellation(self.cancel.clone());

        info!(page_size = cfg.page_size, limit = ?cfg.limit, "Starting user ingestion");

        let mut pages = CursorPaginator::new(&self.client, Endpoint::USERS, cfg.page_size);
        let mut buffer: Vec<RawPayload> = Vec::new();
        let mut accepted = 0usize;

        while let Some(page) = pages.next_page().await {
            let mut payloads = page?.payloads;
            if let Some(limit) = cfg.limit {
                payloads.truncate(limit.saturating_sub(accepted));
            }
            accepted += payloads.len();
            buffer.extend(payloads);

            while buffer.len() >= cfg.chunk_size {
                let rest = buffer.split_off(cfg.chunk_size);
                let chunk = std::mem::replace(&mut buffer, rest);
                self.write_user_chunk(&normalizer, &writer, &chunk, &mut report).await?;
            }

            if cfg.limit.is_some_and(|limit| accepted >= limit) {
                break;
            }
        }

        if !buffer.is_empty() {
            self.write_user_chunk(&normalizer, &writer, &buffer, &mut report).await?;
        }

        info!(
            users = report.payloads,
            upserted = report.rows_upserted,
            malformed = report.malformed,
            dropped = report.dropped,
            "User ingestion completed"
        );
        Ok(report)
    }

    async fn write_user_chunk(
        &self,
        normalizer: &UserNormalizer,
        writer: &AdaptiveWriter<S>,
        chunk: &[RawPayload],
        report: &mut StageReport,
    ) -> Result<()> {
        self.write_payloads(normalizer, writer, chunk, report).await?;
        report.chunks += 1;
        report.payloads += chunk.len();
        info!(users = report.payloads, "Ingested users (cumulative)");
        Ok(())
    }

    /// Harvest and write one chunk; returns the harvest and rows upserted
    async fn process_bet_chunk(
        &self,
        harvester: &ChunkedHarvester,
        normalizer: &BetNormalizer,
        writer: &AdaptiveWriter<S>,
        chunk: &[Subject],
        report: &mut StageReport,
    ) -> Result<(ChunkHarvest, u64)> {
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        let harvest = harvester.process(chunk, self.bets.worker_count).await?;
        let before = report.rows_upserted;
        self.write_payloads(normalizer, writer, &harvest.payloads, report)
            .await?;
        Ok((harvest, report.rows_upserted - before))
    }

    /// Harvest bets for stored users, optionally resuming at a username
    pub async fn run_bets(&self, start_username: Option<&str>) -> Result<StageReport> {
        let cfg = &self.bets;
        let mut report = StageReport::new("bets");
        let normalizer = BetNormalizer::new();
        let writer = AdaptiveWriter::new(self.store.clone(), cfg.max_params_per_statement)
            .with_cancellation(self.cancel.clone());
        let harvester =
            ChunkedHarvester::new(self.client.clone(), Endpoint::BETS, cfg.page_size, cfg.threshold);

        info!(
            threshold = cfg.threshold,
            workers = cfg.worker_count,
            chunk_size = cfg.user_chunk_size,
            start_username = ?start_username,
            "Starting bet ingestion"
        );

        let mut chunks = stream_chunks(&self.store, cfg.user_chunk_size, start_username).await?;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let resume_label = chunk.first().map(|s| s.label.clone());

            let outcome = self
                .process_bet_chunk(&harvester, &normalizer, &writer, &chunk, &mut report)
                .await;

            let (harvest, upserted) = match outcome {
                Ok(done) => done,
                Err(e) => {
                    warn!(
                        error = %e,
                        resume_label = ?resume_label,
                        "Bet ingestion interrupted; rerun with --start-username to resume"
                    );
                    return Err(e);
                },
            };

            report.chunks += 1;
            report.subjects_scanned += chunk.len();
            report.qualifying += harvest.qualifying_count;
            report.skipped += harvest.skipped;
            report.failed += harvest.failed;
            report.payloads += harvest.payloads.len();
            report.last_label = chunk.last().map(|s| s.label.clone());

            info!(
                chunk = report.chunks,
                scanned = chunk.len(),
                qualifying = harvest.qualifying_count,
                skipped = harvest.skipped,
                failed = harvest.failed,
                bets = harvest.payloads.len(),
                upserted,
                total_scanned = report.subjects_scanned,
                total_upserted = report.rows_upserted,
                total_dropped = report.dropped,
                last_username = ?report.last_label,
                "Chunk complete"
            );
        }

        info!(
            users = report.subjects_scanned,
            qualifying = report.qualifying,
            bets = report.payloads,
            upserted = report.rows_upserted,
            malformed = report.malformed,
            dropped = report.dropped,
            "Bet ingestion completed"
        );
        Ok(report)
    }

    /// Refresh markets created by the most active bettors
    pub async fn run_contracts(&self) -> Result<StageReport> {
        self.run_top_user_stage(
            "contracts",
            Endpoint::MARKETS,
            &ContractNormalizer::new(),
            &self.contracts,
        )
        .await
    }

    /// Refresh comments written by the most active bettors
    pub async fn run_comments(&self) -> Result<StageReport> {
        self.run_top_user_stage(
            "comments",
            Endpoint::COMMENTS,
            &CommentNormalizer::new(),
            &self.comments,
        )
        .await
    }

    /// Drain `endpoint` for each of the top `user_limit` users by stored bet
    /// count and write what they own. A failed fetch keeps whatever pages
    /// arrived and moves on to the next user.
    async fn run_top_user_stage<N: Normalizer>(
        &self,
        stage: &'static str,
        endpoint: Endpoint,
        normalizer: &N,
        cfg: &TopUsersStageConfig,
    ) -> Result<StageReport> {
        let mut report = StageReport::new(stage);

        if cfg.user_limit == 0 {
            info!(stage, "User limit is zero; skipping stage");
            return Ok(report);
        }

        let ranked = self.store.top_subjects(cfg.user_limit).await?;
        if ranked.is_empty() {
            warn!(stage, "No users with stored bets; nothing to refresh");
            return Ok(report);
        }
        info!(stage, users = ranked.len(), limit = cfg.user_limit, "Selected users");

        let writer = AdaptiveWriter::new(self.store.clone(), cfg.max_params_per_statement)
            .with_cancellation(self.cancel.clone());

        for RankedSubject { subject, item_count } in &ranked {
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            let drained = CursorPaginator::new(&self.client, endpoint, cfg.page_size)
                .for_subject(subject.id.as_str())
                .drain()
                .await;
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            report.subjects_scanned += 1;
            let complete = drained.is_complete();
            if let Some(ref e) = drained.stopped {
                warn!(stage, subject = %subject, error = %e, "Fetch stopped early");
                report.failed += 1;
            }

            let fetched = drained.payloads.len();
            let owned: Vec<RawPayload> = drained
                .payloads
                .into_iter()
                .filter(|p| endpoint.owned_by(p, &subject.id))
                .collect();
            if owned.len() < fetched {
                debug!(
                    stage,
                    subject = %subject,
                    foreign = fetched - owned.len(),
                    "Dropped records owned by other users"
                );
            }

            if owned.is_empty() {
                if complete {
                    info!(stage, subject = %subject, "Nothing to update");
                    report.skipped += 1;
                }
                continue;
            }

            let before = report.rows_upserted;
            self.write_payloads(normalizer, &writer, &owned, &mut report).await?;
            report.chunks += 1;
            report.qualifying += 1;
            report.payloads += owned.len();
            report.last_label = Some(subject.label.clone());

            info!(
                stage,
                subject = %subject,
                bet_count = *item_count,
                upserted = report.rows_upserted - before,
                "Upserted records for user"
            );
        }

        info!(
            stage,
            users = report.subjects_scanned,
            records = report.payloads,
            upserted = report.rows_upserted,
            malformed = report.malformed,
            dropped = report.dropped,
            failed = report.failed,
            "Stage completed"
        );
        Ok(report)
    }
}
