use std::collections::BTreeMap;
use std::future::Future;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use futures::StreamExt as _;
use url::Url;

use crate::cli::ScrapeArgs;
use crate::fetch::{FetchConfig, FetchError, HttpFetcher, PageSource, RawPage};
use crate::formats::RunSummary;
use crate::key::{Key, Place, State};
use crate::parse::{self, ParseError, Parsed};
use crate::store::CheckpointStore;

/// Resolves when the run should stop at the next safe point.
pub type Shutdown<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

pub const EXIT_OK: u8 = 0;
pub const EXIT_HALTED: u8 = 1;
pub const EXIT_FAILED_KEYS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Processed in this order; sorted and de-duplicated by [`RunOptions::new`].
    pub states: Vec<State>,
    pub years: RangeInclusive<u16>,
    pub concurrency: usize,
}

impl RunOptions {
    pub fn new(states: &[State], years: RangeInclusive<u16>, concurrency: usize) -> Self {
        let mut states = if states.is_empty() {
            State::ALL.to_vec()
        } else {
            states.to_vec()
        };
        states.sort();
        states.dedup();
        Self {
            states,
            years,
            concurrency: concurrency.max(1),
        }
    }
}

/// Lifecycle of one key within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pending,
    Fetching,
    Parsing,
    Writing,
    Completed,
    Skipped,
    Failed,
}

fn transition(key: &Key, state: KeyState) {
    tracing::debug!(key = %key, ?state, "key state");
}

/// Result of the fetch and parse half of a key, before anything is written.
enum Fetched {
    Parsed(Parsed),
    NotFound { status: u16 },
    Failed { reason: String, dropped_rows: usize },
    LayoutMismatch(ParseError),
}

impl Fetched {
    fn from_fetch_error(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { status, .. } => Fetched::NotFound { status },
            err @ FetchError::Unavailable { .. } => Fetched::Failed {
                reason: err.to_string(),
                dropped_rows: 0,
            },
        }
    }
}

/// A key together with the names the listing gave its unit.
#[derive(Debug, Clone)]
struct PendingKey {
    key: Key,
    place: Place,
}

/// Fetches the GP-year page, or one page per gram sabha when the GP-year
/// held several, each paired with the date it was narrowed to.
async fn fetch_pages<S: PageSource + ?Sized>(
    source: &S,
    key: &Key,
) -> Result<Vec<(Option<String>, RawPage)>, FetchError> {
    let page = source.fetch(key).await?;
    let dates = parse::gram_sabha_dates(&page);
    if dates.len() <= 1 {
        return Ok(vec![(None, page)]);
    }

    tracing::debug!(key = %key, dates = dates.len(), "several gram sabhas; fetching each");
    let mut pages = Vec::with_capacity(dates.len());
    let mut not_found = None;
    for date in dates {
        match source.fetch_gram_sabha(key, &date.value).await {
            Ok(page) => pages.push((Some(date.label), page)),
            Err(err @ FetchError::NotFound { .. }) => {
                tracing::info!(key = %key, date = %date.label, %err, "gram sabha page missing");
                not_found = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    match not_found {
        Some(err) if pages.is_empty() => Err(err),
        _ => Ok(pages),
    }
}

async fn fetch_and_parse<S: PageSource + ?Sized>(source: &S, pending: PendingKey) -> (Key, Fetched) {
    let PendingKey { key, place } = pending;
    transition(&key, KeyState::Fetching);
    let pages = match fetch_pages(source, &key).await {
        Ok(pages) => pages,
        Err(err) => return (key, Fetched::from_fetch_error(err)),
    };

    transition(&key, KeyState::Parsing);
    let mut merged = Parsed {
        records: Vec::new(),
        dropped_rows: 0,
        strategy: None,
    };
    for (label, page) in &pages {
        match parse::parse(page) {
            Ok(parsed) => {
                merged.dropped_rows += parsed.dropped_rows;
                merged.strategy = merged.strategy.or(parsed.strategy);
                merged
                    .records
                    .extend(parsed.records.into_iter().map(|mut record| {
                        record.place = place.clone();
                        if record.gs_date.is_none() {
                            record.gs_date = label.clone();
                        }
                        record
                    }));
            }
            Err(err @ ParseError::LayoutMismatch { .. }) => {
                return (key, Fetched::LayoutMismatch(err));
            }
            Err(ParseError::MissingFields { dropped, .. }) => merged.dropped_rows += dropped,
            Err(err @ ParseError::NotFindingsPage { .. }) => {
                let fetched = Fetched::Failed {
                    reason: err.to_string(),
                    dropped_rows: 0,
                };
                return (key, fetched);
            }
        }
    }

    if merged.records.is_empty() && merged.dropped_rows > 0 {
        let fetched = Fetched::Failed {
            reason: format!(
                "{key}: all {} row(s) are missing required fields",
                merged.dropped_rows
            ),
            dropped_rows: merged.dropped_rows,
        };
        return (key, fetched);
    }
    (key, Fetched::Parsed(merged))
}

enum Flow {
    Continue,
    Stop,
}

/// Runs every selected state through listing expansion and the key pipeline.
///
/// Errors that would make the checkpoint inconsistent or that affect every
/// later key stop the run; they are reported in `halted`, not as `Err`.
pub async fn run_with<S: PageSource + ?Sized>(
    source: &S,
    store: &mut CheckpointStore,
    options: &RunOptions,
    mut shutdown: Shutdown<'_>,
) -> RunSummary {
    let mut summary = RunSummary {
        started_at: Utc::now().to_rfc3339(),
        ..RunSummary::default()
    };

    for &state in &options.states {
        let expanded = tokio::select! {
            biased;
            () = &mut shutdown => {
                summary.interrupted = true;
                break;
            }
            expanded = expand_state(source, state, options.years.clone(), &mut summary) => expanded,
        };
        let keys = match expanded {
            Ok(keys) => keys,
            Err(err) => {
                tracing::error!(%err, "listing layout changed; halting");
                summary.halted = Some(err.to_string());
                break;
            }
        };

        let before = keys.len();
        let pending = keys
            .into_iter()
            .filter(|pending| !store.is_done(&pending.key))
            .collect::<Vec<_>>();
        summary.resumed += before - pending.len();
        tracing::info!(%state, keys = before, pending = pending.len(), "processing state");

        let flow = process_keys(
            source,
            store,
            pending,
            options.concurrency,
            &mut summary,
            &mut shutdown,
        )
        .await;
        if let Flow::Stop = flow {
            break;
        }
    }

    summary.finished_at = Utc::now().to_rfc3339();
    summary
}

async fn expand_state<S: PageSource + ?Sized>(
    source: &S,
    state: State,
    years: RangeInclusive<u16>,
    summary: &mut RunSummary,
) -> Result<Vec<PendingKey>, ParseError> {
    let mut units = BTreeMap::new();
    for year in years {
        let page = match source.fetch_listing(state, year).await {
            Ok(page) => page,
            Err(FetchError::NotFound { status, .. }) => {
                tracing::info!(%state, year, status, "no listing for year; skipping");
                summary.skipped += 1;
                continue;
            }
            Err(err @ FetchError::Unavailable { .. }) => {
                tracing::warn!(%err, "listing unavailable");
                summary.failed += 1;
                summary.failures.push(err.to_string());
                continue;
            }
        };

        let listed = parse::parse_listing(&page)?;
        if listed.is_empty() {
            tracing::info!(%state, year, "no GP-years reported; skipping");
            summary.skipped += 1;
            continue;
        }
        tracing::debug!(%state, year, units = listed.len(), "listing parsed");
        units.extend(listed.into_iter().map(|unit| ((unit.code, year), unit.place)));
    }

    Ok(units
        .into_iter()
        .map(|((unit, year), place)| PendingKey {
            key: Key::new(state, unit, year),
            place,
        })
        .collect())
}

async fn process_keys<S: PageSource + ?Sized>(
    source: &S,
    store: &mut CheckpointStore,
    pending: Vec<PendingKey>,
    concurrency: usize,
    summary: &mut RunSummary,
    shutdown: &mut Shutdown<'_>,
) -> Flow {
    for pending in &pending {
        transition(&pending.key, KeyState::Pending);
    }

    // Fetches overlap up to `concurrency`, but results arrive in key order
    // and every write happens here, on one task.
    let mut results = futures::stream::iter(pending)
        .map(|pending| fetch_and_parse(source, pending))
        .buffered(concurrency);

    loop {
        let next = tokio::select! {
            biased;
            () = &mut *shutdown => {
                tracing::warn!("interrupted; stopping before the next write");
                summary.interrupted = true;
                return Flow::Stop;
            }
            next = results.next() => next,
        };
        let Some((key, fetched)) = next else {
            return Flow::Continue;
        };

        match fetched {
            Fetched::Parsed(parsed) => {
                transition(&key, KeyState::Writing);
                match store.commit(&key, &parsed.records) {
                    Ok(ack) => {
                        transition(&key, KeyState::Completed);
                        if parsed.dropped_rows > 0 {
                            tracing::warn!(
                                key = %key,
                                dropped = parsed.dropped_rows,
                                "rows missing required fields were left out"
                            );
                        }
                        tracing::info!(key = %key, records = ack.records, "completed");
                        summary.completed += 1;
                        summary.records_written += ack.records;
                        summary.dropped_rows += parsed.dropped_rows;
                    }
                    Err(err) => {
                        transition(&key, KeyState::Failed);
                        tracing::error!(key = %key, %err, "write failed; halting");
                        summary.failed += 1;
                        summary.halted = Some(err.to_string());
                        return Flow::Stop;
                    }
                }
            }
            Fetched::NotFound { status } => {
                if let Err(err) = store.mark_skipped(&key, status) {
                    transition(&key, KeyState::Failed);
                    tracing::error!(key = %key, %err, "write failed; halting");
                    summary.failed += 1;
                    summary.halted = Some(err.to_string());
                    return Flow::Stop;
                }
                transition(&key, KeyState::Skipped);
                tracing::info!(key = %key, status, "not found upstream; skipped");
                summary.skipped += 1;
            }
            Fetched::Failed {
                reason,
                dropped_rows,
            } => {
                transition(&key, KeyState::Failed);
                tracing::warn!(key = %key, %reason, "failed");
                summary.failed += 1;
                summary.dropped_rows += dropped_rows;
                summary.failures.push(reason);
            }
            Fetched::LayoutMismatch(err) => {
                transition(&key, KeyState::Failed);
                tracing::error!(%err, "page layout changed; halting");
                summary.failed += 1;
                summary.halted = Some(err.to_string());
                return Flow::Stop;
            }
        }
    }
}

pub fn exit_code(summary: &RunSummary) -> u8 {
    if summary.halted.is_some() || summary.interrupted {
        EXIT_HALTED
    } else if summary.failed > 0 {
        EXIT_FAILED_KEYS
    } else {
        EXIT_OK
    }
}

pub async fn run(args: ScrapeArgs) -> anyhow::Result<RunSummary> {
    if args.from_year > args.to_year {
        anyhow::bail!(
            "--from-year ({}) must not be after --to-year ({})",
            args.from_year,
            args.to_year
        );
    }

    let base_url = Url::parse(&args.base_url).context("parse --base-url")?;
    if base_url.scheme() != "http" && base_url.scheme() != "https" {
        anyhow::bail!("--base-url must be http/https: {base_url}");
    }

    let mut config = FetchConfig::new(base_url);
    config.max_attempts = args.max_attempts.max(1);
    config.backoff = Duration::from_millis(args.backoff_ms);
    config.min_delay = Duration::from_millis(args.delay_ms);
    config.timeout = Duration::from_secs(args.timeout_secs.max(1));
    let fetcher = HttpFetcher::new(config).context("build fetcher")?;

    let mut store = CheckpointStore::open(&args.out).context("open checkpoint store")?;
    let options = RunOptions::new(
        &args.states,
        args.from_year..=args.to_year,
        usize::from(args.concurrency),
    );
    tracing::info!(
        out = %store.dir().display(),
        states = options.states.len(),
        from_year = args.from_year,
        to_year = args.to_year,
        concurrency = options.concurrency,
        "scrape: start"
    );

    let shutdown: Shutdown<'_> = Box::pin(async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    });
    let summary = run_with(&fetcher, &mut store, &options, shutdown).await;

    crate::store::write_summary(store.dir(), &summary)
        .await
        .context("write run summary")?;
    Ok(summary)
}
