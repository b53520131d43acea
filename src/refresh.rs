//! Refresh cycles.
//!
//! A cycle fetches, parses and normalizes each configured registry in its
//! own task, merges what came back into one table, publishes it and swaps it
//! in for lookups. Registries that fail fall back to the entries of their
//! last successful cycle.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures::FutureExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use crate::config::Config;
use crate::config::ConfigError;
use crate::consolidate::Consolidation;
use crate::delegations;
use crate::delegations::ParsedStats;
use crate::delegations::Registry;
use crate::fetch::FetchOutcome;
use crate::fetch::Fetcher;
use crate::fetch::SourceLocation;
use crate::fetch::Validators;
use crate::lookup::LookupTable;
use crate::lookup::TableHandle;
use crate::normalize::NormalizedStats;
use crate::publish::PublishError;
use crate::publish::TablePublisher;
use crate::report::CycleReport;
use crate::report::RegistryReport;
use crate::report::RegistryState;
use crate::table::TableEntry;


//------------ CachedSource --------------------------------------------------

/// The last successful data of one registry.
#[derive(Clone, Debug, Default)]
struct CachedSource {
    validators: Validators,
    entries: Arc<Vec<TableEntry>>,
    records: usize,
    skipped_lines: usize,
    skipped_records: usize,
}

impl CachedSource {
    fn seeded(entries: Vec<TableEntry>) -> Self {
        CachedSource { entries: Arc::new(entries), ..Default::default() }
    }
}


//------------ Fetched -------------------------------------------------------

/// What the task for one registry returns.
#[derive(Debug)]
enum Fetched {
    Fresh(CachedSource),
    Unchanged,
    Failed(String),
}


//------------ RegistryOutcome -----------------------------------------------

/// The data a cycle uses for one registry.
#[derive(Debug)]
enum RegistryOutcome {
    Current { source: CachedSource, unchanged: bool },
    Stale { source: CachedSource, reason: String },
    Failed { reason: String },
}

impl RegistryOutcome {
    fn combine(fetched: Option<Fetched>, cached: Option<&CachedSource>) -> Self {
        let reason = match fetched {
            Some(Fetched::Fresh(source)) => {
                return RegistryOutcome::Current { source, unchanged: false }
            }
            Some(Fetched::Unchanged) => match cached {
                Some(source) => {
                    return RegistryOutcome::Current {
                        source: source.clone(), unchanged: true
                    }
                }
                None => "unchanged, but nothing cached".to_string()
            }
            Some(Fetched::Failed(reason)) => reason,
            None => "did not finish within the cycle timeout".to_string()
        };

        match cached {
            Some(source) => RegistryOutcome::Stale { source: source.clone(), reason },
            None => RegistryOutcome::Failed { reason }
        }
    }

    fn is_current(&self) -> bool {
        matches!(self, RegistryOutcome::Current { .. })
    }

    fn source(&self) -> Option<&CachedSource> {
        match self {
            RegistryOutcome::Current { source, .. } => Some(source),
            RegistryOutcome::Stale { source, .. } => Some(source),
            RegistryOutcome::Failed { .. } => None
        }
    }

    fn report(&self, registry: Registry) -> RegistryReport {
        let (state, reason) = match self {
            RegistryOutcome::Current { unchanged: false, .. } => {
                (RegistryState::Current, None)
            }
            RegistryOutcome::Current { unchanged: true, .. } => {
                (RegistryState::Unchanged, None)
            }
            RegistryOutcome::Stale { reason, .. } => {
                (RegistryState::Stale, Some(reason.clone()))
            }
            RegistryOutcome::Failed { reason } => {
                (RegistryState::Failed, Some(reason.clone()))
            }
        };
        let source = self.source();
        RegistryReport {
            registry,
            state,
            records: source.map(|s| s.records).unwrap_or(0),
            skipped_lines: source.map(|s| s.skipped_lines).unwrap_or(0),
            skipped_records: source.map(|s| s.skipped_records).unwrap_or(0),
            entries: source.map(|s| s.entries.len()).unwrap_or(0),
            reason
        }
    }
}


//------------ Refresher -----------------------------------------------------

pub struct Refresher {
    sources: Vec<(Registry, SourceLocation)>,
    fetcher: Fetcher,
    publisher: TablePublisher,
    handle: Arc<TableHandle>,
    workers: usize,
    cycle_timeout: Duration,
    memory_budget: usize,

    /// Held for the duration of a cycle.
    cache: Mutex<HashMap<Registry, CachedSource>>,
}

impl Refresher {
    /// Sets up refreshing, seeding lookups and stale data from the table
    /// published earlier, if any.
    pub fn new(config: &Config) -> Result<Self, RefreshError> {
        config.validate()?;

        let mut sources = vec![];
        for source in &config.sources {
            sources.push((source.registry, source.location()?));
        }
        sources.sort_by_key(|(registry, _)| *registry);

        let fetcher = Fetcher::new(config.request_timeout(), config.retry.policy())
            .map_err(|e| RefreshError::Client(e.to_string()))?;
        let publisher = TablePublisher::new(&config.output);

        let mut cache = HashMap::new();
        let handle = match publisher.load() {
            Ok(Some(table)) => {
                info!(
                    "loaded {} entries from {}",
                    table.len(), publisher.path().display()
                );
                for (registry, entries) in table.by_registry() {
                    cache.insert(registry, CachedSource::seeded(entries));
                }
                TableHandle::new(LookupTable::from(table))
            }
            Ok(None) => TableHandle::empty(),
            Err(err) => {
                warn!(
                    "ignoring published table {}: {}",
                    publisher.path().display(), err
                );
                TableHandle::empty()
            }
        };

        Ok(Refresher {
            sources,
            fetcher,
            publisher,
            handle: Arc::new(handle),
            workers: config.workers,
            cycle_timeout: config.cycle_timeout(),
            memory_budget: config.lookup_memory_budget(),
            cache: Mutex::new(cache),
        })
    }

    /// The table lookups should use.
    pub fn handle(&self) -> Arc<TableHandle> {
        self.handle.clone()
    }

    /// Runs one refresh cycle, unless one is running already.
    pub async fn run_cycle(&self) -> Result<CycleReport, RefreshError> {
        let mut cache = self.cache.try_lock()
            .map_err(|_| RefreshError::AlreadyRunning)?;

        let started = Utc::now();
        info!("refresh cycle started");

        let mut fetched = self.fetch_all(&cache).await;

        let outcomes: Vec<(Registry, RegistryOutcome)> = self.sources.iter()
            .map(|(registry, _)| {
                let outcome = RegistryOutcome::combine(
                    fetched.remove(registry), cache.get(registry)
                );
                match &outcome {
                    RegistryOutcome::Stale { reason, .. } => {
                        warn!("using stale {} data: {}", registry, reason)
                    }
                    RegistryOutcome::Failed { reason } => {
                        warn!("no {} data: {}", registry, reason)
                    }
                    RegistryOutcome::Current { .. } => {}
                }
                (*registry, outcome)
            })
            .collect();

        if !outcomes.iter().any(|(_, outcome)| outcome.is_current()) {
            return Err(RefreshError::NoCurrentData)
        }

        let consolidation = Consolidation::merge(
            outcomes.iter()
                .filter_map(|(_, outcome)| outcome.source())
                .flat_map(|source| source.entries.iter().cloned())
        );
        let duplicates = consolidation.duplicates();
        let (table, conflicts) = consolidation.into_parts();

        let footprint = table.footprint();
        if footprint > self.memory_budget {
            warn!(
                "table takes about {} MiB, more than the budget of {} MiB",
                footprint / (1024 * 1024),
                self.memory_budget / (1024 * 1024)
            );
        }

        let entries = table.len();
        let publisher = self.publisher.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            publisher.publish(&table).map(|_| LookupTable::from(table))
        }).await??;
        self.handle.swap(lookup);
        info!("swapped in table with {} entries", entries);

        let registries = outcomes.iter()
            .map(|(registry, outcome)| outcome.report(*registry))
            .collect();

        for (registry, outcome) in outcomes {
            if let RegistryOutcome::Current { source, .. } = outcome {
                cache.insert(registry, source);
            }
        }

        Ok(CycleReport {
            started,
            finished: Utc::now(),
            registries,
            entries,
            duplicates,
            conflicts,
            published: self.publisher.path().to_path_buf(),
        })
    }

    /// Runs a cycle now and then every `every`, until the process ends.
    ///
    /// A cycle still running when the next one is due makes that one be
    /// skipped.
    pub async fn watch(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let refresher = self.clone();
            tokio::spawn(async move {
                match refresher.run_cycle().await {
                    Ok(report) => {
                        let stale = report.registries.iter()
                            .filter(|r| r.state != RegistryState::Current
                                && r.state != RegistryState::Unchanged)
                            .count();
                        info!(
                            "refresh cycle done: {} entries, {} conflicts, \
                             {} registries not current",
                            report.entries, report.conflicts.len(), stale
                        );
                    }
                    Err(RefreshError::AlreadyRunning) => {
                        info!("skipped refresh: previous cycle still running")
                    }
                    Err(err) => error!("refresh cycle failed: {}", err)
                }
            });
        }
    }

    /// Fetches all registries at the same time, bounded by the worker count
    /// and the cycle timeout.
    async fn fetch_all(
        &self,
        cache: &HashMap<Registry, CachedSource>
    ) -> HashMap<Registry, Fetched> {
        let deadline = Instant::now() + self.cycle_timeout;
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = FuturesUnordered::new();
        let mut aborts = vec![];

        for (registry, location) in &self.sources {
            let registry = *registry;
            let location = location.clone();
            let known = cache.get(&registry)
                .map(|source| source.validators.clone())
                .unwrap_or_default();
            let fetcher = self.fetcher.clone();
            let permits = permits.clone();

            let task = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                refresh_registry(&fetcher, registry, &location, &known).await
            });
            aborts.push(task.abort_handle());
            tasks.push(task.map(move |res| (registry, res)));
        }

        let mut res = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.next()).await {
                Ok(Some((registry, Ok(fetched)))) => {
                    res.insert(registry, fetched);
                }
                Ok(Some((registry, Err(err)))) => {
                    error!("{} refresh task failed: {}", registry, err);
                    res.insert(registry, Fetched::Failed(err.to_string()));
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("refresh cycle timed out, aborting unfinished registries");
                    for abort in &aborts {
                        abort.abort();
                    }
                    break
                }
            }
        }
        res
    }
}


/// Fetches, parses and normalizes one registry.
async fn refresh_registry(
    fetcher: &Fetcher,
    registry: Registry,
    location: &SourceLocation,
    known: &Validators
) -> Fetched {
    let payload = match fetcher.fetch(registry, location, known).await {
        Ok(FetchOutcome::Fresh(payload)) => payload,
        Ok(FetchOutcome::Unchanged) => return Fetched::Unchanged,
        Err(err) => return Fetched::Failed(err.kind.to_string()),
    };

    let (text, validators) = payload.into_parts();
    let digested = tokio::task::spawn_blocking(move || {
        digest(registry, &text)
    }).await;

    match digested {
        Ok(Ok(mut source)) => {
            source.validators = validators;
            Fetched::Fresh(source)
        }
        Ok(Err(err)) => {
            warn!("{}", err);
            Fetched::Failed(err.to_string())
        }
        Err(err) => Fetched::Failed(err.to_string())
    }
}

fn digest(registry: Registry, text: &str) -> Result<CachedSource, delegations::Error> {
    let parsed = ParsedStats::from_text(registry, text)?;
    let normalized = NormalizedStats::from_records(parsed.records());

    info!(
        "{} stats serial {}: {} records, {} entries",
        registry,
        parsed.header().serial(),
        parsed.records().len(),
        normalized.entries().len()
    );

    Ok(CachedSource {
        validators: Validators::default(),
        records: parsed.records().len(),
        skipped_lines: parsed.failures().len(),
        skipped_records: normalized.failures().len(),
        entries: Arc::new(normalized.into_entries()),
    })
}


//------------ RefreshError --------------------------------------------------

#[derive(Debug, Display)]
pub enum RefreshError {
    #[display(fmt = "A refresh cycle is already running")]
    AlreadyRunning,

    #[display(fmt = "No registry has current data, not publishing")]
    NoCurrentData,

    #[display(fmt = "{}", _0)]
    Config(ConfigError),

    #[display(fmt = "Cannot set up HTTP client: {}", _0)]
    Client(String),

    #[display(fmt = "Cannot publish table: {}", _0)]
    Publish(PublishError),

    #[display(fmt = "Publishing was interrupted: {}", _0)]
    Join(JoinError),
}

impl From<ConfigError> for RefreshError {
    fn from(e: ConfigError) -> Self { RefreshError::Config(e) }
}

impl From<PublishError> for RefreshError {
    fn from(e: PublishError) -> Self { RefreshError::Publish(e) }
}

impl From<JoinError> for RefreshError {
    fn from(e: JoinError) -> Self { RefreshError::Join(e) }
}

impl std::error::Error for RefreshError {}


//------------ Tests --------------------------------------------------------
