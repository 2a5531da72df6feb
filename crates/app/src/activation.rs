use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use hostmap_core::{ActivationRecord, TapMode};
use hostmap_storage::{OptionsError, OptionsRepository};

use crate::Clock;

pub const ACTIVATION_OPTION: &str = "hostmap_activation";

/// Persisted record of whether domain resolution is wired in.
///
/// Reads are memoized behind a single-flight cell that only `tap` replaces,
/// so concurrent first reads share one storage round trip.
#[derive(Clone)]
pub struct ActivationStore {
    options: OptionsRepository,
    clock: Clock,
    cache: Arc<Mutex<Arc<OnceCell<ActivationRecord>>>>,
}

impl ActivationStore {
    pub fn new(options: OptionsRepository, clock: Clock) -> Self {
        Self {
            options,
            clock,
            cache: Arc::new(Mutex::new(Arc::new(OnceCell::new()))),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn current_cell(&self) -> Arc<OnceCell<ActivationRecord>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_cell(&self, record: ActivationRecord) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(OnceCell::new_with(Some(record)));
    }

    /// Returns the activation record, hitting storage only on the first call
    /// after construction or a `tap`.
    pub async fn read(&self) -> Result<ActivationRecord, ActivationError> {
        let cell = self.current_cell();
        let record = cell
            .get_or_try_init(|| async {
                let stored: Option<ActivationRecord> = self.options.get(ACTIVATION_OPTION).await?;
                Ok::<_, ActivationError>(
                    stored.unwrap_or_else(|| ActivationRecord::absent(self.now())),
                )
            })
            .await?;
        Ok(record.clone())
    }

    /// Applies a lifecycle transition. Returns `false` without writing when the
    /// persisted record is already in the target state.
    pub async fn tap(&self, mode: TapMode) -> Result<bool, ActivationError> {
        let now = self.now();
        let mut tx = self.options.begin().await?;
        let current: ActivationRecord = self
            .options
            .get_in(&mut tx, ACTIVATION_OPTION)
            .await?
            .unwrap_or_else(|| ActivationRecord::absent(now));

        let Some(next) = current.tapped(mode, now) else {
            tx.rollback().await.map_err(OptionsError::from)?;
            self.replace_cell(current);
            return Ok(false);
        };

        self.options
            .put_in(&mut tx, ACTIVATION_OPTION, &next, now)
            .await?;
        tx.commit().await.map_err(OptionsError::from)?;
        self.replace_cell(next.clone());

        counter!("activation_taps_total", "mode" => mode.as_str()).increment(1);
        info!(stage = "bootstrap", %mode, active = next.active, "activation record updated");
        Ok(true)
    }

    /// `tap` for the bootstrap path: failures are logged and reported as "no change".
    pub async fn maybe_tap(&self, mode: TapMode) -> bool {
        match self.tap(mode).await {
            Ok(changed) => changed,
            Err(err) => {
                warn!(stage = "bootstrap", %mode, error = %err, "activation tap failed");
                false
            }
        }
    }

    /// Read-only diagnostic view of the activation record.
    pub async fn system_info(&self) -> Result<ActivationRecord, ActivationError> {
        self.read().await
    }
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("activation record unavailable: {0}")]
    PersistenceUnavailable(#[from] OptionsError),
}
