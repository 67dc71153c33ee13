//! Task and plan-group persistence.

use rusqlite::params;

use super::RunStore;
use crate::errors::{SqResult, StoreError};
use crate::model::{Task, TaskStatus};

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> SqResult<TaskStatus> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        other => return Err(StoreError::MalformedArtifact(format!("unknown task status '{other}'")).into()),
    })
}

impl RunStore {
    pub fn write_task(&self, run_id: &str, task: &Task, position: u32) -> SqResult<()> {
        self.conn
            .execute(
                "INSERT INTO tasks (id, run_id, title, description, status, dependencies_json,
                 estimated_iterations, assigned_loop, position)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(run_id, id) DO UPDATE SET
                   title=excluded.title, description=excluded.description, status=excluded.status,
                   dependencies_json=excluded.dependencies_json, estimated_iterations=excluded.estimated_iterations,
                   assigned_loop=excluded.assigned_loop",
                params![
                    task.id,
                    run_id,
                    task.title,
                    task.description,
                    status_str(task.status),
                    serde_json::to_string(&task.dependencies).unwrap(),
                    task.estimated_iterations,
                    task.assigned_loop,
                    position,
                ],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn complete_task(&self, run_id: &str, task_id: &str) -> SqResult<()> {
        self.set_task_status(run_id, task_id, TaskStatus::Completed)
    }

    pub fn fail_task(&self, run_id: &str, task_id: &str) -> SqResult<()> {
        self.set_task_status(run_id, task_id, TaskStatus::Failed)
    }

    pub fn set_task_status(&self, run_id: &str, task_id: &str, status: TaskStatus) -> SqResult<()> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?3 WHERE run_id = ?1 AND id = ?2",
                params![run_id, task_id, status_str(status)],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    pub fn assign_task_loop(&self, run_id: &str, task_id: &str, loop_id: &str) -> SqResult<()> {
        self.conn
            .execute(
                "UPDATE tasks SET assigned_loop = ?3, status = 'in_progress' WHERE run_id = ?1 AND id = ?2",
                params![run_id, task_id, loop_id],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Ordered by insertion (spec §4.6 "load tasks for run (ordered by
    /// insertion)").
    pub fn load_tasks(&self, run_id: &str) -> SqResult<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, description, status, dependencies_json, estimated_iterations, assigned_loop
                 FROM tasks WHERE run_id = ?1 ORDER BY position ASC",
            )
            .map_err(StoreError::Database)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(StoreError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, title, description, status, deps_json, estimated_iterations, assigned_loop) =
                row.map_err(StoreError::Database)?;
            out.push(Task {
                id,
                title,
                description,
                status: status_from_str(&status)?,
                dependencies: serde_json::from_str(&deps_json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?,
                estimated_iterations,
                assigned_loop,
            });
        }
        Ok(out)
    }

    pub fn add_plan_group(&self, run_id: &str, group_index: u32, task_ids: &[String]) -> SqResult<()> {
        self.conn
            .execute(
                "INSERT INTO plan_groups (run_id, group_index, task_ids_json) VALUES (?1,?2,?3)
                 ON CONFLICT(run_id, group_index) DO UPDATE SET task_ids_json = excluded.task_ids_json",
                params![run_id, group_index, serde_json::to_string(task_ids).unwrap()],
            )
            .map_err(StoreError::Database)?;
        Ok(())
    }

    /// Ordered by group index (spec §4.6).
    pub fn load_plan_groups(&self, run_id: &str) -> SqResult<Vec<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_ids_json FROM plan_groups WHERE run_id = ?1 ORDER BY group_index ASC")
            .map_err(StoreError::Database)?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0)).map_err(StoreError::Database)?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(StoreError::Database)?;
            out.push(serde_json::from_str(&json).map_err(|e| StoreError::MalformedArtifact(e.to_string()))?);
        }
        Ok(out)
    }
}
