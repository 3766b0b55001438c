use hiresense::workflows::screening::{RepositoryError, RunId, RunRecord, RunRepository};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Run history kept for the lifetime of the process.
#[derive(Default, Clone)]
pub(crate) struct InMemoryRunRepository {
    records: Arc<Mutex<HashMap<RunId, RunRecord>>>,
}

impl InMemoryRunRepository {
    fn records(&self) -> Result<MutexGuard<'_, HashMap<RunId, RunRecord>>, RepositoryError> {
        self.records
            .lock()
            .map_err(|_| RepositoryError::Unavailable("run history lock poisoned".to_string()))
    }
}

impl RunRepository for InMemoryRunRepository {
    fn save(&self, record: RunRecord) -> Result<(), RepositoryError> {
        self.records()?.insert(record.run_id.clone(), record);
        Ok(())
    }

    fn fetch(&self, id: &RunId) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.records()?.get(id).cloned())
    }
}
