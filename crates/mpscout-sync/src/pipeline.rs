//! Drives one scout run: per search term, navigate and reveal, then walk the result list
//! one re-resolved candidate at a time.

use anyhow::{Context, Result};
use chrono::Utc;
use mpscout_adapters::{
    hide_login_prompt, read_candidate, selectors, DetailExtractor, DetailOutcome, ExtractionError,
    FilterChain, OverlayPolicy, OverlayRecovery, PageSession, SessionError,
};
use mpscout_core::{FilterOutcome, ListingRecord, RunSummary, ScreenedListing, TermReport};
use mpscout_storage::{
    sink_for_path, DedupLedger, NoopNotifier, Notifier, RecordSink, SlackNotifier, SnapshotStore,
    WebhookClientConfig,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RunSettings;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("browser session failed: {0}")]
    Session(#[from] SessionError),
}

enum CandidateStep {
    Continue,
    ListShrank,
}

pub struct ScoutPipeline {
    settings: RunSettings,
    ledger: DedupLedger,
    sink: Box<dyn RecordSink>,
    notifier: Box<dyn Notifier>,
    snapshots: Option<SnapshotStore>,
    filter: FilterChain,
    extractor: DetailExtractor,
    recovery: OverlayRecovery,
}

impl ScoutPipeline {
    /// Opens the ledger, record sink, notifier and snapshot store named by `settings`.
    pub fn new(settings: RunSettings) -> Result<Self> {
        let ledger = DedupLedger::load(&settings.deduplication_file).with_context(|| {
            format!("loading dedup ledger {}", settings.deduplication_file.display())
        })?;
        let sink = sink_for_path(&settings.output_file);
        let notifier: Box<dyn Notifier> = match &settings.slack_webhook_url {
            Some(url) => Box::new(SlackNotifier::new(url.clone(), WebhookClientConfig::default())?),
            None => Box::new(NoopNotifier),
        };
        let snapshots = settings.snapshot_dir.clone().map(SnapshotStore::new);
        info!(
            ledger = %ledger.path().display(),
            known_ids = ledger.len(),
            output = %sink.target().display(),
            notifications = settings.slack_webhook_url.is_some(),
            "pipeline ready"
        );
        Ok(Self::with_parts(settings, ledger, sink, notifier).with_snapshots(snapshots))
    }

    pub fn with_parts(
        settings: RunSettings,
        ledger: DedupLedger,
        sink: Box<dyn RecordSink>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let filter = FilterChain::new(&settings.anti_keywords);
        let extractor = DetailExtractor::new(settings.timeout, settings.max_listing_age);
        let recovery = OverlayRecovery::new(OverlayPolicy::for_timeout(settings.timeout));
        Self {
            settings,
            ledger,
            sink,
            notifier,
            snapshots: None,
            filter,
            extractor,
            recovery,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Option<SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    /// Newest-first, local-pickup-only results for `term` in `location`.
    pub fn search_url(&self, location: &str, term: &str) -> String {
        format!(
            "{}/{}/search/?query={}&sortBy=creation_time_descend&deliveryMethod=local_only",
            self.settings.base_url,
            location,
            urlencoding::encode(term)
        )
    }

    /// Scouts every term in order. Only an unusable session stops the run early.
    pub async fn run<S: PageSession>(
        &mut self,
        session: &S,
        terms: &[String],
        location: &str,
    ) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scout_run", %run_id, location);
        self.run_terms(session, terms, location, run_id)
            .instrument(span)
            .await
    }

    async fn run_terms<S: PageSession>(
        &mut self,
        session: &S,
        terms: &[String],
        location: &str,
        run_id: Uuid,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        info!(terms = terms.len(), "scout run started");
        let mut reports = Vec::with_capacity(terms.len());
        for term in terms {
            let report = self
                .run_term(session, term, location)
                .instrument(info_span!("term", term = %term))
                .await?;
            reports.push(report);
        }
        let new_records = reports.iter().map(|r| r.committed).sum();
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            location: location.to_string(),
            terms: reports,
            new_records,
        })
    }

    async fn run_term<S: PageSession>(
        &mut self,
        session: &S,
        term: &str,
        location: &str,
    ) -> Result<TermReport, PipelineError> {
        let url = self.search_url(location, term);
        let mut report = TermReport {
            term: term.to_string(),
            url: url.clone(),
            ..TermReport::default()
        };
        match self.scan_results(session, &url, &mut report).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                error!(error = %err, "search term failed; continuing with the next one");
                report.error = Some(err.to_string());
            }
        }
        info!(
            committed = report.committed,
            seen = report.candidates_seen,
            duplicates = report.duplicates,
            excluded = report.excluded,
            too_old = report.too_old,
            failed = report.failed,
            "finished search term"
        );
        Ok(report)
    }

    async fn scan_results<S: PageSession>(
        &mut self,
        session: &S,
        url: &str,
        report: &mut TermReport,
    ) -> Result<(), SessionError> {
        info!(%url, "navigating to search results");
        session.goto(url).await?;
        tokio::time::sleep(self.settings.human_delay.sample()).await;
        self.recovery.dismiss_obstructions(session).await?;
        self.reveal(session).await?;

        let initial = session.find_all(selectors::CANDIDATE_LINK).await?.len();
        info!(count = initial, "found candidate listings");
        for index in 0..initial {
            match self.handle_candidate(session, index, report).await? {
                CandidateStep::Continue => {}
                CandidateStep::ListShrank => {
                    warn!(index, "result list shrank; ending this search term");
                    report.page_shrank = true;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn reveal<S: PageSession>(&self, session: &S) -> Result<(), SessionError> {
        debug!(passes = self.settings.reveal_passes, "scrolling to load listings");
        for _ in 0..self.settings.reveal_passes {
            hide_login_prompt(session).await?;
            session.scroll_to_bottom().await?;
            tokio::time::sleep(self.settings.reveal_settle).await;
            // Obstructions can come back once new content renders.
            self.recovery.dismiss_obstructions(session).await?;
        }
        hide_login_prompt(session).await?;
        Ok(())
    }

    /// Processes the candidate at `index` of a freshly re-resolved result list.
    ///
    /// Returns `Err` only for a fatal session error; anything else is logged and skipped.
    async fn handle_candidate<S: PageSession>(
        &mut self,
        session: &S,
        index: usize,
        report: &mut TermReport,
    ) -> Result<CandidateStep, SessionError> {
        let cards = match session.find_all(selectors::CANDIDATE_LINK).await {
            Ok(cards) => cards,
            Err(err) => return skip_transient(err, "N/A", report).map(|_| CandidateStep::Continue),
        };
        let Some(card) = cards.into_iter().nth(index) else {
            return Ok(CandidateStep::ListShrank);
        };
        report.candidates_seen += 1;

        let candidate = match read_candidate(session, &card).await {
            Ok(candidate) => candidate,
            Err(err) => return skip_transient(err, "N/A", report).map(|_| CandidateStep::Continue),
        };
        let decision = self.filter.evaluate(&candidate, &mut self.ledger);
        if let Some(err) = &decision.ledger_error {
            warn!(title = candidate.log_label(), error = %err, "exclusion not persisted; it may reappear next run");
        }
        match decision.outcome {
            FilterOutcome::Passed => {}
            FilterOutcome::Duplicate => {
                debug!(title = candidate.log_label(), "already seen");
                report.duplicates += 1;
                return Ok(CandidateStep::Continue);
            }
            outcome if outcome.records_exclusion() => {
                info!(title = candidate.log_label(), reason = outcome.as_str(), "excluded listing");
                report.excluded += 1;
                return Ok(CandidateStep::Continue);
            }
            outcome => {
                debug!(link = %candidate.raw_link, reason = outcome.as_str(), "skipped candidate");
                report.skipped += 1;
                return Ok(CandidateStep::Continue);
            }
        }
        let Some(listing) = decision.screened else {
            return Ok(CandidateStep::Continue);
        };

        info!(title = %listing.title, "opening listing detail view");
        let result = self.extractor.extract(session, &card, &listing).await;
        if let Err(err) = &result {
            if err.wants_snapshot() {
                self.capture_snapshot(session, &listing, err).await;
            }
        }
        match result {
            Ok(DetailOutcome::Extracted(record)) => self.commit(record, report).await,
            Ok(DetailOutcome::TooOld { age, post_time_str }) => {
                info!(title = %listing.title, post_time = %post_time_str, ?age, "skipping listing older than the age limit");
                report.too_old += 1;
            }
            Err(ExtractionError::Session(err)) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(title = %listing.title, error = %err, "could not process listing");
                report.failed += 1;
            }
        }

        self.close_detail_view(session).await?;
        tokio::time::sleep(self.settings.candidate_pause.sample()).await;
        Ok(CandidateStep::Continue)
    }

    /// Writes the record, then marks its id seen, then notifies.
    async fn commit(&mut self, record: ListingRecord, report: &mut TermReport) {
        if let Err(err) = self.sink.append(&record) {
            error!(id = %record.id, error = %err, "could not write listing; leaving it unrecorded");
            report.failed += 1;
            return;
        }
        if let Err(err) = self.ledger.record(&record.id) {
            warn!(id = %record.id, error = %err, "listing written but its id was not persisted");
        }
        report.committed += 1;
        info!(id = %record.id, title = %record.title, price = %record.price, "found new listing");
        if let Err(err) = self.notifier.notify(&record).await {
            warn!(id = %record.id, error = %err, "notification failed");
        }
    }

    /// Leaves the page with no detail view open, whatever happened before.
    async fn close_detail_view<S: PageSession>(&self, session: &S) -> Result<(), SessionError> {
        self.recovery.dismiss_obstructions(session).await?;
        match session
            .wait_until_absent(selectors::DIALOG, self.settings.dialog_close_timeout)
            .await
        {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "detail view did not close");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn capture_snapshot<S: PageSession>(
        &self,
        session: &S,
        listing: &ScreenedListing,
        err: &ExtractionError,
    ) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let kind = match err {
            ExtractionError::ViewDidNotOpen(_) => "view-did-not-open",
            _ => "time-unavailable",
        };
        let bytes = match session.screenshot().await {
            Ok(bytes) => bytes,
            Err(shot_err) => {
                warn!(id = %listing.id, error = %shot_err, "could not take debug screenshot");
                return;
            }
        };
        let label = format!("{}-{kind}", listing.id);
        match store.store_bytes(Utc::now(), &label, "png", &bytes).await {
            Ok(stored) => info!(path = %stored.absolute_path.display(), "saved debug snapshot"),
            Err(store_err) => warn!(id = %listing.id, error = %store_err, "could not save debug snapshot"),
        }
    }
}

fn skip_transient(err: SessionError, title: &str, report: &mut TermReport) -> Result<(), SessionError> {
    if err.is_fatal() {
        return Err(err);
    }
    warn!(title, error = %err, "skipping candidate after a page error");
    report.skipped += 1;
    Ok(())
}
