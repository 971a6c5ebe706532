use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::pty::{PtyBackend, PtyProcess, PtySpec};
use super::session::{clamp_size, TabChannel, TabCommand, TabEvent, TabSpec, TerminalSession};
use super::TabState;
use crate::error_handling::types::TerminalError;
use crate::secrets::{SecretAggregator, SecretKind};
use crate::transport::EphemeralAgent;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

struct TabEntry {
    client: String,
    info: Arc<Mutex<TerminalSession>>,
    /// Weak so that a client dropping its sender still closes the tab
    commands: mpsc::WeakSender<TabCommand>,
    task: Option<JoinHandle<()>>,
}

/// Open tabs plus slots reserved by tabs still connecting.
#[derive(Default)]
struct Registry {
    tabs: HashMap<Uuid, TabEntry>,
    reserved: HashMap<String, usize>,
}

impl Registry {
    fn in_use(&self, client: &str) -> usize {
        let open = self.tabs.values().filter(|t| t.client == client).count();
        open + self.reserved.get(client).copied().unwrap_or(0)
    }

    fn release_reservation(&mut self, client: &str) {
        if let Some(n) = self.reserved.get_mut(client) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.reserved.remove(client);
            }
        }
    }
}

/// State shared by the manager and every tab task.
struct Shared {
    backend: Arc<dyn PtyBackend>,
    secrets: Arc<SecretAggregator>,
    allowed_shells: Vec<String>,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a requested shell against the allowlist.
    fn resolve_shell(&self, requested: Option<&str>) -> Result<PathBuf, TerminalError> {
        let Some(requested) = requested.filter(|s| !s.trim().is_empty()) else {
            return self
                .allowed_shells
                .iter()
                .find_map(|name| which::which(name).ok())
                .ok_or_else(|| TerminalError::ShellNotAllowed("no allowed shell is installed".into()));
        };
        let name = Path::new(requested)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !self.allowed_shells.iter().any(|allowed| allowed == name) {
            return Err(TerminalError::ShellNotAllowed(requested.to_string()));
        }
        which::which(requested).map_err(|_| TerminalError::ShellNotAllowed(requested.to_string()))
    }

    /// Spawns the pseudo-terminal, loading the credential into a fresh agent
    /// first when one is selected.
    async fn connect(
        &self,
        tag: &Uuid,
        shell: &Path,
        credential_id: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<Connection, TerminalError> {
        let agent = match credential_id {
            Some(id) => {
                let key = self.secrets.get_text(SecretKind::Credential, id).await?;
                let agent = EphemeralAgent::start(&key)
                    .await
                    .map_err(|e| TerminalError::Agent(e.to_string()))?;
                debug!("[{}] Credential {} loaded into session agent", tag, id);
                Some(agent)
            }
            None => None,
        };

        let mut env: Vec<(OsString, OsString)> = vec![("TERM".into(), "xterm-256color".into())];
        let mut env_remove: Vec<OsString> = vec!["SHELLWARD_ENCRYPTION_KEY".into()];
        match &agent {
            Some(agent) => env.push(("SSH_AUTH_SOCK".into(), agent.socket_path().into())),
            None => env_remove.push("SSH_AUTH_SOCK".into()),
        }
        let spec = PtySpec {
            program: shell.as_os_str().to_owned(),
            args: vec!["-l".into()],
            env,
            env_remove,
            cols,
            rows,
        };
        match self.backend.spawn(spec) {
            Ok(process) => Ok(Connection {
                process,
                agent,
                killed: false,
            }),
            Err(e) => {
                if let Some(agent) = agent {
                    agent.shutdown().await;
                }
                Err(e)
            }
        }
    }
}

/// One live pseudo-terminal and the agent scoped to it.
struct Connection {
    process: PtyProcess,
    agent: Option<EphemeralAgent>,
    killed: bool,
}

impl Connection {
    async fn teardown(mut self) {
        self.process.control.kill();
        self.killed = true;
        if let Some(agent) = self.agent.take() {
            agent.shutdown().await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // aborted tab task; the agent kills itself on drop
        if !self.killed {
            self.process.control.kill();
        }
    }
}

/// Owns every open terminal tab.
///
/// Each client may hold at most `max_tabs_per_client` tabs; the slot is
/// reserved before anything is spawned, so a rejected request leaves nothing
/// behind.
pub struct TerminalManager {
    shared: Arc<Shared>,
    max_tabs_per_client: usize,
}

impl TerminalManager {
    pub fn new(
        backend: Arc<dyn PtyBackend>,
        secrets: Arc<SecretAggregator>,
        allowed_shells: Vec<String>,
        max_tabs_per_client: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                secrets,
                allowed_shells,
                registry: Mutex::new(Registry::default()),
            }),
            max_tabs_per_client,
        }
    }

    pub async fn open_tab(&self, client: &str, spec: TabSpec) -> Result<TabChannel, TerminalError> {
        let shell = self.shared.resolve_shell(spec.shell.as_deref())?;
        {
            let mut registry = self.shared.registry();
            if registry.in_use(client) >= self.max_tabs_per_client {
                warn!("Client {} reached the limit of {} tabs", client, self.max_tabs_per_client);
                return Err(TerminalError::TabLimitReached);
            }
            *registry.reserved.entry(client.to_string()).or_insert(0) += 1;
        }

        let id = Uuid::new_v4();
        let (cols, rows) = clamp_size(spec.cols, spec.rows);
        let credential_id = spec.credential_id.filter(|c| !c.is_empty());
        let info = Arc::new(Mutex::new(TerminalSession {
            id,
            client: client.to_string(),
            shell: shell.display().to_string(),
            state: TabState::Created,
            cols,
            rows,
            credential_id: credential_id.clone(),
            credential_loaded: false,
            created_at: Utc::now(),
        }));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let tab = Tab {
            id,
            info: info.clone(),
            shared: self.shared.clone(),
            events: event_tx,
        };

        tab.set_state(TabState::Connecting);
        let connection = match self
            .shared
            .connect(&id, &shell, credential_id.as_deref(), cols, rows)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.shared.registry().release_reservation(client);
                warn!("[{}] Could not open tab: {}", id, e);
                return Err(e);
            }
        };
        lock(&info).credential_loaded = connection.agent.is_some();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        {
            let mut registry = self.shared.registry();
            registry.release_reservation(client);
            registry.tabs.insert(
                id,
                TabEntry {
                    client: client.to_string(),
                    info: info.clone(),
                    commands: command_tx.downgrade(),
                    task: None,
                },
            );
        }
        tab.set_state(TabState::Connected);
        info!("[{}] Tab opened for {} running {}", id, client, shell.display());

        let handle = tokio::spawn(tab.run(connection, command_rx));
        if let Some(entry) = self.shared.registry().tabs.get_mut(&id) {
            entry.task = Some(handle);
        }

        Ok(TabChannel {
            id,
            commands: command_tx,
            events: event_rx,
        })
    }

    /// Closes a tab and waits for its process to be gone. The slot is free
    /// once this returns.
    pub async fn close_tab(&self, id: Uuid) -> Result<(), TerminalError> {
        let entry = self
            .shared
            .registry()
            .tabs
            .remove(&id)
            .ok_or(TerminalError::NotFound)?;
        stop(id, entry).await;
        Ok(())
    }

    pub fn list_tabs(&self) -> Vec<TerminalSession> {
        let registry = self.shared.registry();
        let mut tabs: Vec<TerminalSession> =
            registry.tabs.values().map(|t| lock(&t.info).clone()).collect();
        tabs.sort_by_key(|t| t.created_at);
        tabs
    }

    pub fn tab_count(&self, client: &str) -> usize {
        self.shared.registry().in_use(client)
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<(Uuid, TabEntry)> = self.shared.registry().tabs.drain().collect();
        if !entries.is_empty() {
            info!("Closing {} terminal tabs", entries.len());
        }
        futures::future::join_all(entries.into_iter().map(|(id, entry)| stop(id, entry))).await;
    }
}

fn lock(info: &Mutex<TerminalSession>) -> MutexGuard<'_, TerminalSession> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn stop(id: Uuid, entry: TabEntry) {
    if let Some(commands) = entry.commands.upgrade() {
        let _ = commands.try_send(TabCommand::Close);
    }
    if let Some(mut task) = entry.task {
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            error!("[{}] Tab task did not stop in time, aborting it", id);
            task.abort();
        }
    }
}

/// Task side of one tab.
struct Tab {
    id: Uuid,
    info: Arc<Mutex<TerminalSession>>,
    shared: Arc<Shared>,
    events: mpsc::Sender<TabEvent>,
}

impl Tab {
    /// Records the state and tells the client, unless its queue is full.
    fn set_state(&self, state: TabState) {
        lock(&self.info).state = state;
        let _ = self.events.try_send(TabEvent::State {
            session_id: self.id,
            state,
        });
    }

    async fn run(self, mut connection: Connection, mut commands: mpsc::Receiver<TabCommand>) {
        loop {
            tokio::select! {
                chunk = connection.process.output.recv() => match chunk {
                    Some(data) => {
                        if self.events.send(TabEvent::Output(data)).await.is_err() {
                            debug!("[{}] Client went away", self.id);
                            break;
                        }
                    }
                    None => {
                        info!("[{}] Shell exited", self.id);
                        break;
                    }
                },
                command = commands.recv() => match command {
                    None | Some(TabCommand::Close) => break,
                    Some(TabCommand::Input(data)) => {
                        if let Err(e) = connection.process.control.write(&data) {
                            warn!("[{}] Input dropped: {}", self.id, e);
                        }
                    }
                    Some(TabCommand::Resize { cols, rows }) => {
                        let (cols, rows) = clamp_size(Some(cols), Some(rows));
                        match connection.process.control.resize(cols, rows) {
                            Ok(()) => {
                                let mut info = lock(&self.info);
                                info.cols = cols;
                                info.rows = rows;
                            }
                            Err(e) => warn!("[{}] Resize failed: {}", self.id, e),
                        }
                    }
                    Some(TabCommand::Reconnect { shell, credential_id }) => {
                        match self.reconnect(connection, shell, credential_id).await {
                            Ok(fresh) => connection = fresh,
                            Err(()) => {
                                self.finish();
                                return;
                            }
                        }
                    }
                },
            }
        }
        connection.teardown().await;
        self.finish();
    }

    /// Replaces the connection. On `Err` the old one is already torn down and
    /// the tab must close.
    async fn reconnect(
        &self,
        current: Connection,
        shell: Option<String>,
        credential_id: Option<String>,
    ) -> Result<Connection, ()> {
        let (current_shell, current_credential, cols, rows) = {
            let info = lock(&self.info);
            (info.shell.clone(), info.credential_id.clone(), info.cols, info.rows)
        };
        let shell = match self
            .shared
            .resolve_shell(Some(shell.as_deref().unwrap_or(&current_shell)))
        {
            Ok(shell) => shell,
            Err(e) => {
                let _ = self.events.try_send(TabEvent::Error(e.to_string()));
                return Ok(current);
            }
        };
        let credential_id = match credential_id {
            Some(c) if c.is_empty() => None,
            Some(c) => Some(c),
            None => current_credential,
        };

        info!("[{}] Reconnecting", self.id);
        self.set_state(TabState::Reconnecting);
        current.teardown().await;

        match self
            .shared
            .connect(&self.id, &shell, credential_id.as_deref(), cols, rows)
            .await
        {
            Ok(fresh) => {
                {
                    let mut info = lock(&self.info);
                    info.shell = shell.display().to_string();
                    info.credential_loaded = fresh.agent.is_some();
                    info.credential_id = credential_id;
                }
                self.set_state(TabState::Connected);
                Ok(fresh)
            }
            Err(e) => {
                warn!("[{}] Reconnect failed: {}", self.id, e);
                let _ = self.events.try_send(TabEvent::Error(e.to_string()));
                Err(())
            }
        }
    }

    fn finish(&self) {
        self.shared.registry().tabs.remove(&self.id);
        {
            let mut info = lock(&self.info);
            info.credential_loaded = false;
        }
        self.set_state(TabState::Closed);
        info!("[{}] Tab closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::AuditLog;
    use crate::secrets::aggregator::test_support::MemoryProvider;
    use crate::secrets::SecretOrigin;
    use crate::session_management::pty::test_support::FakePtyBackend;

    fn manager(max: usize) -> (TerminalManager, Arc<FakePtyBackend>) {
        let backend = Arc::new(FakePtyBackend::default());
        let secrets = Arc::new(SecretAggregator::new(
            Arc::new(MemoryProvider::new(SecretOrigin::Local)),
            None,
            Duration::from_secs(1),
            Arc::new(AuditLog::disabled()),
        ));
        let manager = TerminalManager::new(backend.clone(), secrets, vec!["sh".into()], max);
        (manager, backend)
    }

    fn sh() -> TabSpec {
        TabSpec {
            shell: Some("sh".into()),
            ..TabSpec::default()
        }
    }

    async fn next_output(channel: &mut TabChannel) -> Vec<u8> {
        loop {
            match channel.events.recv().await {
                Some(TabEvent::Output(data)) => return data,
                Some(_) => continue,
                None => panic!("tab closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_tab_limit_and_release() {
        let (manager, backend) = manager(2);
        let first = manager.open_tab("10.0.0.1", sh()).await.unwrap();
        let _second = manager.open_tab("10.0.0.1", sh()).await.unwrap();

        let err = manager.open_tab("10.0.0.1", sh()).await.err().unwrap();
        assert!(matches!(err, TerminalError::TabLimitReached));
        assert_eq!(backend.spawned.lock().unwrap().len(), 2);
        assert_eq!(manager.tab_count("10.0.0.1"), 2);

        // other clients have their own budget
        manager.open_tab("10.0.0.2", sh()).await.unwrap();

        manager.close_tab(first.id).await.unwrap();
        assert_eq!(*backend.kills.lock().unwrap(), 1);
        manager.open_tab("10.0.0.1", sh()).await.unwrap();
        assert!(matches!(
            manager.open_tab("10.0.0.1", sh()).await.err().unwrap(),
            TerminalError::TabLimitReached
        ));
    }

    #[tokio::test]
    async fn test_disallowed_shell_is_rejected_without_side_effects() {
        let (manager, backend) = manager(1);
        let spec = TabSpec {
            shell: Some("/usr/bin/python3".into()),
            ..TabSpec::default()
        };
        assert!(matches!(
            manager.open_tab("c", spec).await.err().unwrap(),
            TerminalError::ShellNotAllowed(_)
        ));
        assert!(backend.spawned.lock().unwrap().is_empty());
        assert_eq!(manager.tab_count("c"), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_releases_the_slot() {
        let (manager, backend) = manager(1);
        let spec = TabSpec {
            credential_id: Some("missing".into()),
            ..sh()
        };
        assert!(matches!(
            manager.open_tab("c", spec).await.err().unwrap(),
            TerminalError::Secret(_)
        ));
        assert!(backend.spawned.lock().unwrap().is_empty());
        assert_eq!(manager.tab_count("c"), 0);
        manager.open_tab("c", sh()).await.unwrap();
    }

    #[tokio::test]
    async fn test_input_resize_and_state_events() {
        let (manager, backend) = manager(4);
        let mut tab = manager.open_tab("c", sh()).await.unwrap();
        assert_eq!(
            tab.events.recv().await,
            Some(TabEvent::State {
                session_id: tab.id,
                state: TabState::Connecting
            })
        );

        tab.commands.send(TabCommand::Input(b"ls\r".to_vec())).await.unwrap();
        assert_eq!(next_output(&mut tab).await, b"ls\r".to_vec());

        tab.commands
            .send(TabCommand::Resize { cols: 120, rows: 40 })
            .await
            .unwrap();
        tab.commands.send(TabCommand::Input(b"x".to_vec())).await.unwrap();
        next_output(&mut tab).await;
        assert_eq!(*backend.resizes.lock().unwrap(), vec![(120, 40)]);
        let listed = manager.list_tabs();
        assert_eq!((listed[0].cols, listed[0].rows), (120, 40));
        assert_eq!(listed[0].state, TabState::Connected);

        let spawned = backend.spawned.lock().unwrap();
        assert!(spawned[0].env_remove.contains(&OsString::from("SSH_AUTH_SOCK")));
    }

    #[tokio::test]
    async fn test_reconnect_spawns_a_fresh_pty_under_the_same_id() {
        let (manager, backend) = manager(4);
        let mut tab = manager.open_tab("c", sh()).await.unwrap();
        tab.commands
            .send(TabCommand::Reconnect {
                shell: None,
                credential_id: None,
            })
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Some(event) = tab.events.recv().await {
            if let TabEvent::State { session_id, state } = event {
                assert_eq!(session_id, tab.id);
                states.push(state);
                if states.len() == 4 {
                    break;
                }
            }
        }
        assert_eq!(
            states,
            vec![
                TabState::Connecting,
                TabState::Connected,
                TabState::Reconnecting,
                TabState::Connected
            ]
        );
        assert_eq!(backend.spawned.lock().unwrap().len(), 2);
        assert_eq!(*backend.kills.lock().unwrap(), 1);
        assert_eq!(manager.list_tabs().len(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_the_tab() {
        let (manager, backend) = manager(1);
        let tab = manager.open_tab("c", sh()).await.unwrap();
        drop(tab);
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.tab_count("c") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*backend.kills.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_every_tab() {
        let (manager, backend) = manager(4);
        let _a = manager.open_tab("a", sh()).await.unwrap();
        let _b = manager.open_tab("b", sh()).await.unwrap();
        manager.shutdown_all().await;
        assert!(manager.list_tabs().is_empty());
        assert_eq!(*backend.kills.lock().unwrap(), 2);
    }
}
