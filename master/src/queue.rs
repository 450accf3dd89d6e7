// master/src/queue.rs

use chrono::{DateTime, Duration, Utc};
use common::{
    task_id, QueueCounts, QueueKey, SegmentName, SubTaskSpec, TableName, TaskCompleteRequest,
    TaskId, TaskState, TaskStates, TaskType, WorkerId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{info, warn};

/// Entregas máximas de una sub-tarea: la original y una re-entrega tras timeout.
pub const MAX_DELIVERIES: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("la tarea no tiene segmentos")]
    EmptyTask,

    #[error("el segmento {segment} ya está en la tarea {task_id}")]
    SegmentInFlight { segment: SegmentName, task_id: TaskId },

    #[error("tarea {0} no existe")]
    UnknownTask(TaskId),

    #[error("sub-tarea {index} no existe en {task_id}")]
    UnknownSubTask { task_id: TaskId, index: usize },

    #[error("la tarea {task_id} ya terminó ({state:?})")]
    TaskFinished { task_id: TaskId, state: TaskState },

    #[error("lease vencido o ajeno para {task_id}/{index}")]
    StaleLease { task_id: TaskId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubTaskState {
    Pending,
    Leased {
        worker_id: WorkerId,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Succeeded,
    Failed {
        message: Option<String>,
    },
    /// Venció el lease también en la re-entrega.
    Lost,
    /// La tarea se abortó antes de que alguien la tomara.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SubTask {
    pub segment: SegmentName,
    pub columns: Vec<String>,
    pub state: SubTaskState,
    pub attempts: u32,
}

impl SubTask {
    fn is_done(&self) -> bool {
        !matches!(
            self.state,
            SubTaskState::Pending | SubTaskState::Leased { .. }
        )
    }
}

/// Tarea todavía sin id ni generación, tal como la arma el scheduler.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub table: TableName,
    pub task_type: TaskType,
    /// (segmento, columnas)
    pub sub_tasks: Vec<(SegmentName, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub generation: u64,
    pub table: TableName,
    pub task_type: TaskType,
    pub state: TaskState,
    pub sub_tasks: Vec<SubTask>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.sub_tasks.iter().map(|s| s.segment.as_str())
    }

    fn spec(&self, index: usize) -> SubTaskSpec {
        let sub = &self.sub_tasks[index];
        SubTaskSpec {
            task_id: self.id.clone(),
            index,
            task_type: self.task_type,
            table: self.table.clone(),
            segment: sub.segment.clone(),
            columns: sub.columns.clone(),
            attempt: sub.attempts,
        }
    }

    /// Cuando todas las sub-tareas terminaron, fija el estado final.
    fn finalize_if_done(&mut self, now: DateTime<Utc>) {
        if self.state.is_terminal() || !self.sub_tasks.iter().all(|s| s.is_done()) {
            return;
        }

        let all_ok = self
            .sub_tasks
            .iter()
            .all(|s| s.state == SubTaskState::Succeeded);
        let any_lost = self.sub_tasks.iter().any(|s| s.state == SubTaskState::Lost);

        self.state = if all_ok {
            TaskState::Completed
        } else if any_lost {
            TaskState::TimedOut
        } else {
            TaskState::Failed
        };
        self.finished_at = Some(now);

        if self.state == TaskState::Completed {
            info!("tarea {} COMPLETED ({} segmentos)", self.id, self.sub_tasks.len());
        } else {
            let failed: Vec<&str> = self
                .sub_tasks
                .iter()
                .filter(|s| s.state != SubTaskState::Succeeded)
                .map(|s| s.segment.as_str())
                .collect();
            warn!(
                "tarea {} terminó {:?}; segmentos sin convertir: {:?}",
                self.id, self.state, failed
            );
        }
    }
}

/// Resultado de aplicar un reporte de worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    pub task_state: TaskState,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub redelivered: usize,
    pub lost: usize,
    /// Leases vencidos de tareas ya abortadas.
    pub cancelled: usize,
}

/// Todas las colas de tareas del cluster, una por (tabla, tipo).
#[derive(Debug, Default)]
pub struct TaskQueues {
    queues: BTreeMap<QueueKey, Vec<Task>>,
    next_generation: HashMap<TaskType, u64>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crea la tarea sólo si ninguno de sus segmentos está en otra tarea no
    /// terminal del mismo tipo y tabla. Todo o nada.
    pub fn enqueue_if_disjoint(
        &mut self,
        draft: TaskDraft,
        now: DateTime<Utc>,
    ) -> Result<TaskId, QueueError> {
        if draft.sub_tasks.is_empty() {
            return Err(QueueError::EmptyTask);
        }

        let key = QueueKey {
            table: draft.table.clone(),
            task_type: draft.task_type,
        };

        if let Some(tasks) = self.queues.get(&key) {
            for task in tasks.iter().filter(|t| !t.state.is_terminal()) {
                let busy: HashSet<&str> = task.segments().collect();
                if let Some((segment, _)) =
                    draft.sub_tasks.iter().find(|(s, _)| busy.contains(s.as_str()))
                {
                    return Err(QueueError::SegmentInFlight {
                        segment: segment.clone(),
                        task_id: task.id.clone(),
                    });
                }
            }
        }

        let generation = {
            let next = self.next_generation.entry(draft.task_type).or_insert(0);
            *next += 1;
            *next
        };
        let id = task_id(draft.task_type, generation);

        let task = Task {
            id: id.clone(),
            generation,
            table: draft.table,
            task_type: draft.task_type,
            state: TaskState::NotStarted,
            sub_tasks: draft
                .sub_tasks
                .into_iter()
                .map(|(segment, columns)| SubTask {
                    segment,
                    columns,
                    state: SubTaskState::Pending,
                    attempts: 0,
                })
                .collect(),
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        info!(
            "encolada tarea {} para {} con {} segmentos",
            id,
            key.table,
            task.sub_tasks.len()
        );
        self.queues.entry(key).or_default().push(task);
        Ok(id)
    }

    pub fn list_queues(&self) -> Vec<QueueKey> {
        self.queues.keys().cloned().collect()
    }

    pub fn get_task_states(&self, task_type: TaskType) -> TaskStates {
        self.queues
            .iter()
            .filter(|(k, _)| k.task_type == task_type)
            .flat_map(|(_, tasks)| tasks.iter())
            .map(|t| (t.id.clone(), t.state))
            .collect()
    }

    pub fn queue_counts(&self) -> Vec<QueueCounts> {
        self.queues
            .iter()
            .map(|(key, tasks)| {
                let mut counts = QueueCounts::new(key);
                for task in tasks {
                    counts.bump(task.state);
                    for sub in &task.sub_tasks {
                        match sub.state {
                            SubTaskState::Pending => counts.pending_sub_tasks += 1,
                            SubTaskState::Leased { .. } => counts.in_flight_sub_tasks += 1,
                            _ => {}
                        }
                    }
                }
                counts
            })
            .collect()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.queues.values().flatten().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.queues.values_mut().flatten().find(|t| t.id == id)
    }

    /// Segmentos referenciados por tareas no terminales de esa cola.
    pub fn in_flight_segments(&self, table: &str, task_type: TaskType) -> HashSet<SegmentName> {
        self.tasks_of(table, task_type)
            .filter(|t| !t.state.is_terminal())
            .flat_map(|t| t.segments().map(|s| s.to_string()))
            .collect()
    }

    /// Segmentos que no se convirtieron en tareas FAILED/TIMED_OUT terminadas
    /// después de `since`.
    pub fn recently_failed_segments(
        &self,
        table: &str,
        task_type: TaskType,
        since: DateTime<Utc>,
    ) -> HashSet<SegmentName> {
        self.tasks_of(table, task_type)
            .filter(|t| matches!(t.state, TaskState::Failed | TaskState::TimedOut))
            .filter(|t| t.finished_at.map(|f| f > since).unwrap_or(false))
            .flat_map(|t| {
                t.sub_tasks
                    .iter()
                    .filter(|s| s.state != SubTaskState::Succeeded)
                    .map(|s| s.segment.clone())
            })
            .collect()
    }

    fn tasks_of<'a>(&'a self, table: &str, task_type: TaskType) -> impl Iterator<Item = &'a Task> {
        let key = QueueKey {
            table: table.to_string(),
            task_type,
        };
        self.queues.get(&key).into_iter().flatten()
    }

    /// Sub-tareas con lease vigente por worker.
    pub fn active_by_worker(&self) -> HashMap<WorkerId, u32> {
        let mut out = HashMap::new();
        for task in self.queues.values().flatten() {
            for sub in &task.sub_tasks {
                if let SubTaskState::Leased { worker_id, .. } = &sub.state {
                    *out.entry(worker_id.clone()).or_insert(0) += 1;
                }
            }
        }
        out
    }

    /// Entrega la siguiente sub-tarea pendiente de la tarea más vieja.
    pub fn pull(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Option<SubTaskSpec> {
        let task = self
            .queues
            .values_mut()
            .flatten()
            .filter(|t| !t.state.is_terminal())
            .filter(|t| t.sub_tasks.iter().any(|s| s.state == SubTaskState::Pending))
            .min_by_key(|t| (t.created_at, t.generation))?;

        let index = task
            .sub_tasks
            .iter()
            .position(|s| s.state == SubTaskState::Pending)?;

        let sub = &mut task.sub_tasks[index];
        sub.attempts += 1;
        sub.state = SubTaskState::Leased {
            worker_id: worker_id.to_string(),
            started_at: now,
            expires_at: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        if task.state == TaskState::NotStarted {
            task.state = TaskState::Running;
            task.started_at = Some(now);
        }

        let spec = task.spec(index);
        info!(
            "asignando {}/{} (segmento {}, intento {}) al worker {}",
            spec.task_id, spec.index, spec.segment, spec.attempt, worker_id
        );
        Some(spec)
    }

    /// Aplica el reporte del worker que tiene el lease de la sub-tarea.
    pub fn report(
        &mut self,
        report: &TaskCompleteRequest,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, QueueError> {
        let task = self
            .task_mut(&report.task_id)
            .ok_or_else(|| QueueError::UnknownTask(report.task_id.clone()))?;

        if task.state.is_terminal() {
            return Err(QueueError::TaskFinished {
                task_id: task.id.clone(),
                state: task.state,
            });
        }

        let sub = task
            .sub_tasks
            .get_mut(report.index)
            .ok_or_else(|| QueueError::UnknownSubTask {
                task_id: report.task_id.clone(),
                index: report.index,
            })?;

        let started_at = match &sub.state {
            SubTaskState::Leased {
                worker_id,
                started_at,
                ..
            } if *worker_id == report.worker_id && sub.attempts == report.attempt => *started_at,
            _ => {
                return Err(QueueError::StaleLease {
                    task_id: report.task_id.clone(),
                    index: report.index,
                })
            }
        };

        sub.state = if report.success {
            SubTaskState::Succeeded
        } else {
            warn!(
                "sub-tarea {}/{} (segmento {}) falló: {}",
                report.task_id,
                report.index,
                sub.segment,
                report.message.as_deref().unwrap_or("sin detalle")
            );
            SubTaskState::Failed {
                message: report.message.clone(),
            }
        };

        task.finalize_if_done(now);

        let elapsed_ms = (now - started_at).num_milliseconds().max(0) as u64;
        Ok(ReportOutcome {
            task_state: task.state,
            elapsed_ms,
        })
    }

    /// Aborta una tarea no terminal. Las sub-tareas en vuelo se dejan terminar,
    /// pero sus reportes ya no cambian nada.
    pub fn abort(&mut self, id: &str, now: DateTime<Utc>) -> Result<TaskState, QueueError> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| QueueError::UnknownTask(id.to_string()))?;

        if task.state.is_terminal() {
            return Ok(task.state);
        }

        for sub in task.sub_tasks.iter_mut() {
            if sub.state == SubTaskState::Pending {
                sub.state = SubTaskState::Cancelled;
            }
        }
        task.state = TaskState::Aborted;
        task.finished_at = Some(now);
        warn!("tarea {} abortada", task.id);
        Ok(task.state)
    }

    /// Vence leases: la primera vez la sub-tarea vuelve a la cola, la segunda
    /// se da por perdida. En tareas abortadas el lease vencido se cancela.
    pub fn sweep_expired_leases(&mut self, now: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for task in self.queues.values_mut().flatten() {
            if task.state.is_terminal() {
                for sub in task.sub_tasks.iter_mut() {
                    if matches!(&sub.state, SubTaskState::Leased { expires_at, .. } if *expires_at <= now)
                    {
                        sub.state = SubTaskState::Cancelled;
                        summary.cancelled += 1;
                    }
                }
                continue;
            }
            for (index, sub) in task.sub_tasks.iter_mut().enumerate() {
                let (expired, worker) = match &sub.state {
                    SubTaskState::Leased {
                        expires_at,
                        worker_id,
                        ..
                    } => (*expires_at <= now, worker_id.clone()),
                    _ => continue,
                };
                if !expired {
                    continue;
                }

                if sub.attempts < MAX_DELIVERIES {
                    warn!(
                        "lease vencido de {}/{} (segmento {}, worker {}), se re-entrega",
                        task.id, index, sub.segment, worker
                    );
                    sub.state = SubTaskState::Pending;
                    summary.redelivered += 1;
                } else {
                    warn!(
                        "lease vencido de {}/{} en la re-entrega (worker {}), se da por perdida",
                        task.id, index, worker
                    );
                    sub.state = SubTaskState::Lost;
                    summary.lost += 1;
                }
            }
            task.finalize_if_done(now);
        }

        summary
    }

    /// Olvida tareas terminales que terminaron hace más de `retention`.
    pub fn prune_finished(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut pruned = 0;
        for tasks in self.queues.values_mut() {
            let before = tasks.len();
            tasks.retain(|t| match t.finished_at {
                Some(f) if t.state.is_terminal() => f
                    .checked_add_signed(retention)
                    .map(|until| until > now)
                    .unwrap_or(true),
                _ => true,
            });
            pruned += before - tasks.len();
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn lease() -> Duration {
        Duration::seconds(60)
    }

    fn draft(table: &str, segments: &[&str]) -> TaskDraft {
        TaskDraft {
            table: table.to_string(),
            task_type: TaskType::ConvertToRawIndexTask,
            sub_tasks: segments
                .iter()
                .map(|s| (s.to_string(), vec!["ArrDelay".to_string()]))
                .collect(),
        }
    }

    fn report(spec: &SubTaskSpec, worker: &str, success: bool) -> TaskCompleteRequest {
        TaskCompleteRequest {
            task_id: spec.task_id.clone(),
            index: spec.index,
            worker_id: worker.to_string(),
            attempt: spec.attempt,
            success,
            message: None,
        }
    }

    const CONVERT: TaskType = TaskType::ConvertToRawIndexTask;

    #[test]
    fn enqueue_rechaza_segmentos_en_vuelo() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        assert_eq!(id, "Task_ConvertToRawIndexTask_1");

        let err = q
            .enqueue_if_disjoint(draft("t", &["s2", "s1"]), t0())
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::SegmentInFlight {
                segment: "s1".into(),
                task_id: id.clone()
            }
        );
        // nada quedó a medias
        assert_eq!(q.get_task_states(CONVERT).len(), 1);

        // otra tabla con el mismo nombre de segmento no choca
        assert!(q.enqueue_if_disjoint(draft("u", &["s1"]), t0()).is_ok());
        assert_eq!(q.enqueue_if_disjoint(draft("t", &[]), t0()), Err(QueueError::EmptyTask));
    }

    #[test]
    fn pull_is_exclusive_and_moves_task_to_running() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        assert_eq!(q.get_task_states(CONVERT)[&id], TaskState::NotStarted);

        let a = q.pull("w1", t0(), lease()).unwrap();
        let b = q.pull("w2", t0(), lease()).unwrap();
        assert_eq!((a.segment.as_str(), b.segment.as_str()), ("s0", "s1"));
        assert_eq!(a.attempt, 1);
        assert!(q.pull("w3", t0(), lease()).is_none());
        assert_eq!(q.get_task_states(CONVERT)[&id], TaskState::Running);
        assert_eq!(q.active_by_worker()["w1"], 1);
    }

    #[test]
    fn completed_only_when_every_sub_task_succeeds() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        let a = q.pull("w1", t0(), lease()).unwrap();
        let b = q.pull("w2", t0(), lease()).unwrap();

        let out = q.report(&report(&a, "w1", true), t0()).unwrap();
        assert_eq!(out.task_state, TaskState::Running);
        let out = q
            .report(&report(&b, "w2", true), t0() + Duration::seconds(3))
            .unwrap();
        assert_eq!(out.task_state, TaskState::Completed);
        assert_eq!(out.elapsed_ms, 3000);
        assert!(q.in_flight_segments("t", CONVERT).is_empty());
        assert_eq!(q.task(&id).unwrap().finished_at, Some(t0() + Duration::seconds(3)));
    }

    #[test]
    fn una_falla_marca_la_tarea_failed() {
        let mut q = TaskQueues::new();
        q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        let a = q.pull("w1", t0(), lease()).unwrap();
        let b = q.pull("w2", t0(), lease()).unwrap();

        q.report(&report(&a, "w1", false), t0()).unwrap();
        // sigue no terminal hasta que reporten todas
        assert_eq!(q.in_flight_segments("t", CONVERT).len(), 2);

        let out = q.report(&report(&b, "w2", true), t0()).unwrap();
        assert_eq!(out.task_state, TaskState::Failed);

        let failed = q.recently_failed_segments("t", CONVERT, t0() - Duration::seconds(1));
        assert_eq!(failed, HashSet::from(["s0".to_string()]));
        assert!(q
            .recently_failed_segments("t", CONVERT, t0())
            .is_empty());
    }

    #[test]
    fn reports_from_non_holders_are_rejected() {
        let mut q = TaskQueues::new();
        q.enqueue_if_disjoint(draft("t", &["s0"]), t0()).unwrap();
        let a = q.pull("w1", t0(), lease()).unwrap();

        assert!(matches!(
            q.report(&report(&a, "intruso", true), t0()),
            Err(QueueError::StaleLease { .. })
        ));
        let mut bad_index = report(&a, "w1", true);
        bad_index.index = 7;
        assert!(matches!(
            q.report(&bad_index, t0()),
            Err(QueueError::UnknownSubTask { .. })
        ));
        let mut unknown = report(&a, "w1", true);
        unknown.task_id = "Task_ConvertToRawIndexTask_99".into();
        assert!(matches!(
            q.report(&unknown, t0()),
            Err(QueueError::UnknownTask(_))
        ));
    }

    #[test]
    fn timeout_redelivers_exactly_once_then_completes() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0"]), t0()).unwrap();
        let first = q.pull("w1", t0(), lease()).unwrap();

        // antes de vencer no pasa nada
        assert_eq!(q.sweep_expired_leases(t0() + Duration::seconds(59)), SweepSummary::default());

        let later = t0() + Duration::seconds(61);
        assert_eq!(
            q.sweep_expired_leases(later),
            SweepSummary { redelivered: 1, lost: 0, cancelled: 0 }
        );

        let second = q.pull("w2", later, lease()).unwrap();
        assert_eq!(second.segment, "s0");
        assert_eq!(second.attempt, 2);

        // el worker original reporta tarde: se ignora
        assert!(matches!(
            q.report(&report(&first, "w1", true), later),
            Err(QueueError::StaleLease { .. })
        ));

        let out = q.report(&report(&second, "w2", true), later).unwrap();
        assert_eq!(out.task_state, TaskState::Completed);
        assert_eq!(q.get_task_states(CONVERT)[&id], TaskState::Completed);
    }

    #[test]
    fn second_timeout_marks_task_timed_out() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        let ok = q.pull("w1", t0(), lease()).unwrap();
        q.pull("w2", t0(), lease()).unwrap();
        q.report(&report(&ok, "w1", true), t0()).unwrap();

        let t1 = t0() + Duration::seconds(61);
        q.sweep_expired_leases(t1);
        q.pull("w3", t1, lease()).unwrap();

        let t2 = t1 + Duration::seconds(61);
        assert_eq!(
            q.sweep_expired_leases(t2),
            SweepSummary { redelivered: 0, lost: 1, cancelled: 0 }
        );
        assert_eq!(q.get_task_states(CONVERT)[&id], TaskState::TimedOut);
        assert!(q.pull("w4", t2, lease()).is_none());
        assert_eq!(
            q.recently_failed_segments("t", CONVERT, t0()),
            HashSet::from(["s1".to_string()])
        );
    }

    #[test]
    fn abort_cancels_pending_and_ignores_late_reports() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        let a = q.pull("w1", t0(), lease()).unwrap();

        assert_eq!(q.abort(&id, t0()), Ok(TaskState::Aborted));
        assert!(q.pull("w2", t0(), lease()).is_none());
        assert!(matches!(
            q.report(&report(&a, "w1", true), t0()),
            Err(QueueError::TaskFinished { state: TaskState::Aborted, .. })
        ));
        // abortar de nuevo no cambia nada
        assert_eq!(q.abort(&id, t0()), Ok(TaskState::Aborted));
        assert!(q.in_flight_segments("t", CONVERT).is_empty());
        assert!(matches!(q.abort("nope", t0()), Err(QueueError::UnknownTask(_))));
    }

    #[test]
    fn lease_vencido_de_tarea_abortada_se_cancela() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        q.pull("w1", t0(), lease()).unwrap();
        q.abort(&id, t0()).unwrap();

        // antes de vencer el worker sigue ocupado
        assert_eq!(q.active_by_worker().get("w1"), Some(&1));
        assert_eq!(q.sweep_expired_leases(t0()), SweepSummary::default());

        let later = t0() + Duration::seconds(61);
        assert_eq!(
            q.sweep_expired_leases(later),
            SweepSummary { redelivered: 0, lost: 0, cancelled: 1 }
        );
        assert!(q.active_by_worker().is_empty());
        assert_eq!(q.queue_counts()[0].in_flight_sub_tasks, 0);
        assert_eq!(q.get_task_states(CONVERT)[&id], TaskState::Aborted);
        assert!(q.pull("w2", later, lease()).is_none());
        assert_eq!(q.sweep_expired_leases(later), SweepSummary::default());
    }

    #[test]
    fn pull_prefers_oldest_task_across_tables() {
        let mut q = TaskQueues::new();
        q.enqueue_if_disjoint(draft("zeta", &["z0"]), t0()).unwrap();
        q.enqueue_if_disjoint(draft("alfa", &["a0"]), t0() + Duration::seconds(1))
            .unwrap();

        assert_eq!(q.pull("w1", t0(), lease()).unwrap().table, "zeta");
        assert_eq!(q.pull("w1", t0(), lease()).unwrap().table, "alfa");
    }

    #[test]
    fn counts_and_pruning() {
        let mut q = TaskQueues::new();
        let id = q.enqueue_if_disjoint(draft("t", &["s0", "s1"]), t0()).unwrap();
        q.pull("w1", t0(), lease()).unwrap();

        let counts = q.queue_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!((counts[0].table.as_str(), counts[0].task_type), ("t", CONVERT));
        assert_eq!(counts[0].running, 1);
        assert_eq!(counts[0].pending_sub_tasks, 1);
        assert_eq!(counts[0].in_flight_sub_tasks, 1);
        assert_eq!(q.list_queues(), vec![QueueKey { table: "t".into(), task_type: CONVERT }]);

        q.abort(&id, t0()).unwrap();
        assert_eq!(q.prune_finished(t0() + Duration::seconds(10), Duration::seconds(60)), 0);
        assert_eq!(q.prune_finished(t0() + Duration::seconds(61), Duration::seconds(60)), 1);
        assert!(q.get_task_states(CONVERT).is_empty());
    }
}
