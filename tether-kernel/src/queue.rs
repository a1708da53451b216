/**
 * COMMAND QUEUE - File de commandes par device (pending / executed)
 *
 * CYCLE DE VIE :
 *   enqueue (opérateur) -> pending
 *   poll du device      -> tout pending passe en executed (livraison = exécution supposée)
 *   ack du device       -> executed_at + result, index command_results/{device}/{id}
 *
 * INVARIANT : un id est dans exactement une des deux listes.
 * CONCURRENCE : toute mutation de "commands/{id}" se fait sous le verrou "queue:{id}",
 * ce qui empêche un enqueue de se perdre entre la lecture et la réécriture d'un drain.
 */

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::models::{Command, CommandQueueState, CommandResult, StoredResult};
use crate::push::{PushError, SharedPush};
use crate::registry::{queue_lock_key, DeviceRegistry};
use crate::state::KeyedLocks;
use crate::store::{path_of, SharedStore};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct CommandQueue {
    store: SharedStore,
    clock: SharedClock,
    locks: KeyedLocks,
    push: SharedPush,
    registry: Arc<DeviceRegistry>,
}

fn queue_path(device_id: &str) -> String {
    path_of(&["commands", device_id])
}

fn results_path(device_id: &str) -> String {
    path_of(&["command_results", device_id])
}

fn no_result_placeholder() -> Value {
    json!({"status": "executed", "details": "No result data available"})
}

/// Normalise une commande opérateur : scalaire -> {"command": scalaire}
fn build_command(raw: Value, now: OffsetDateTime) -> EngineResult<Command> {
    let mut map = match raw {
        Value::Null => return Err(EngineError::validation("Missing command")),
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("command".into(), other);
            map
        }
    };

    let tag = match map.remove("command") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        None | Some(Value::Null) | Some(Value::String(_)) => {
            return Err(EngineError::validation("Missing command"))
        }
        Some(other) => other.to_string(),
    };

    // Champs gérés par la file, jamais fournis par l'appelant
    for reserved in ["id", "created_at", "executed_at", "result"] {
        map.remove(reserved);
    }

    Ok(Command {
        id: Uuid::new_v4().to_string(),
        command: tag,
        created_at: Some(now),
        executed_at: None,
        result: None,
        params: map,
    })
}

impl CommandQueue {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        locks: KeyedLocks,
        push: SharedPush,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self { store, clock, locks, push, registry }
    }

    /// Etat courant de la file (lecture seule, sans verrou)
    pub async fn snapshot(&self, device_id: &str) -> EngineResult<CommandQueueState> {
        self.load_state(device_id).await
    }

    async fn load_state(&self, device_id: &str) -> EngineResult<CommandQueueState> {
        match self.store.get(&queue_path(device_id)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(CommandQueueState::default()),
        }
    }

    async fn save_state(&self, device_id: &str, state: &CommandQueueState) -> EngineResult<()> {
        let value = serde_json::to_value(state)?;
        self.store.set(&queue_path(device_id), value).await?;
        Ok(())
    }

    pub async fn enqueue(&self, device_id: &str, command: Value) -> EngineResult<Command> {
        if device_id.is_empty() {
            return Err(EngineError::validation("Missing device_id or command"));
        }
        let cmd = build_command(command, self.clock.now())?;

        {
            let _guard = self.locks.lock(&queue_lock_key(device_id)).await;
            let mut state = self.load_state(device_id).await?;
            state.pending.push(cmd.clone());
            self.save_state(device_id, &state).await?;
        }
        info!("[queue] command {} ({}) queued for {}", cmd.id, cmd.command, device_id);

        self.try_push(device_id, &cmd).await;
        Ok(cmd)
    }

    /// Livraison rapide best-effort ; n'échoue jamais
    async fn try_push(&self, device_id: &str, cmd: &Command) {
        let token = match self.registry.push_token(device_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return,
            Err(e) => {
                warn!("[queue] push token lookup failed for {}: {}", device_id, e);
                return;
            }
        };

        let mut data = cmd.params.clone();
        data.insert("command_id".into(), json!(cmd.id));
        data.insert("command".into(), json!(cmd.command));

        match self.push.send(&token, &data).await {
            Ok(()) => debug!("[queue] pushed command {} to {}", cmd.id, device_id),
            Err(PushError::Disabled) => debug!("[queue] push disabled, {} waits for poll", cmd.id),
            Err(e) => warn!("[queue] push failed for {} (command stays queued): {}", device_id, e),
        }
    }

    /// Rend toute la file pending et la bascule en executed dans la même étape.
    /// Le poll vaut livraison : aucune confirmation d'exécution n'est attendue.
    pub async fn drain_pending(&self, device_id: &str) -> EngineResult<Vec<Command>> {
        let _guard = self.locks.lock(&queue_lock_key(device_id)).await;
        let mut state = self.load_state(device_id).await?;
        if state.pending.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let delivered = std::mem::take(&mut state.pending);
        state.executed.extend(delivered.iter().cloned().map(|mut cmd| {
            cmd.executed_at = Some(now);
            cmd
        }));
        self.save_state(device_id, &state).await?;

        info!("[queue] delivered {} command(s) to {}", delivered.len(), device_id);
        Ok(delivered)
    }

    pub async fn mark_executed(
        &self,
        device_id: &str,
        command_id: &str,
        result: Option<Value>,
    ) -> EngineResult<Command> {
        if device_id.is_empty() || command_id.is_empty() {
            return Err(EngineError::validation("Missing device_id or command_id"));
        }
        let result = result.filter(|r| !r.is_null());

        let _guard = self.locks.lock(&queue_lock_key(device_id)).await;
        let mut state = self.load_state(device_id).await?;
        let now = self.clock.now();

        let updated = if let Some(pos) = state.pending.iter().position(|c| c.id == command_id) {
            let mut cmd = state.pending.remove(pos);
            cmd.executed_at = Some(now);
            if let Some(r) = &result {
                cmd.result = Some(r.clone());
            }
            state.executed.push(cmd.clone());
            cmd
        } else if let Some(cmd) = state.executed.iter_mut().find(|c| c.id == command_id) {
            cmd.executed_at = Some(now);
            if let Some(r) = &result {
                cmd.result = Some(r.clone());
            }
            cmd.clone()
        } else {
            return Err(EngineError::not_found(format!("command {command_id} for device {device_id}")));
        };

        self.save_state(device_id, &state).await?;

        if let Some(result) = result {
            let stored = StoredResult { timestamp: Some(now), result };
            let path = format!("{}/{}", results_path(device_id), crate::store::sanitize_key(command_id));
            self.store.set(&path, serde_json::to_value(stored)?).await?;
        }

        info!("[queue] command {} marked executed for {}", command_id, device_id);
        Ok(updated)
    }

    /// Résultats triés par executed_at décroissant (égalités : ordre d'insertion)
    pub async fn get_results(&self, device_id: &str) -> EngineResult<Vec<CommandResult>> {
        let state = self.load_state(device_id).await?;
        let index: Map<String, Value> = match self.store.get(&results_path(device_id)).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut results = Vec::with_capacity(state.executed.len() + index.len());
        let mut seen = HashSet::new();

        for cmd in &state.executed {
            seen.insert(cmd.id.clone());
            let stored = index
                .get(&cmd.id)
                .and_then(|v| serde_json::from_value::<StoredResult>(v.clone()).ok());
            let entry = match stored {
                Some(stored) => CommandResult {
                    command_id: cmd.id.clone(),
                    command_type: cmd.command.clone(),
                    executed_at: stored.timestamp.or(cmd.executed_at),
                    result: stored.result,
                },
                None => CommandResult {
                    command_id: cmd.id.clone(),
                    command_type: cmd.command.clone(),
                    executed_at: cmd.executed_at,
                    result: cmd.result.clone().unwrap_or_else(no_result_placeholder),
                },
            };
            results.push(entry);
        }

        // Résultats indexés dont la commande a disparu de la liste executed
        for (command_id, raw) in index {
            if seen.contains(&command_id) {
                continue;
            }
            let Ok(stored) = serde_json::from_value::<StoredResult>(raw) else { continue };
            let command_type = state
                .pending
                .iter()
                .find(|c| c.id == command_id)
                .map(|c| c.command.clone())
                .unwrap_or_else(|| "unknown".to_string());
            results.push(CommandResult {
                command_id,
                command_type,
                executed_at: stored.timestamp,
                result: stored.result,
            });
        }

        results.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        debug!("[queue] {} result(s) for {}", results.len(), device_id);
        Ok(results)
    }
}
