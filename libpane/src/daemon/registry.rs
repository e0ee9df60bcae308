// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The session table: id assignment plus create, list, look up, and
//! destroy, all guarded by a single mutex.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use tracing::{info, instrument};

use crate::daemon::session::Session;

/// Ids are a monotone counter, handed out as decimal strings on the
/// wire. The counter lives under the same mutex as the map so an id
/// is burned only by a session that actually started.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    next_id: u64,
    sessions: HashMap<u64, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { inner: Mutex::new(RegistryInner { next_id: 1, sessions: HashMap::new() }) }
    }

    /// Start a child and insert the session. Names are not unique and
    /// may repeat freely. If the child fails to start, nothing is
    /// inserted and the error propagates.
    #[instrument(skip_all)]
    pub fn create(
        &self,
        name: Option<String>,
        command_line: Option<Vec<String>>,
    ) -> anyhow::Result<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        let session = Session::spawn(id, name, command_line)?;
        inner.next_id += 1;
        inner.sessions.insert(id, Arc::clone(&session));
        info!("created session {} (pid {})", id, session.child_pid);
        Ok(session)
    }

    /// All sessions, oldest first (creation time, then id).
    pub fn list(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Arc<Session>> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        sessions
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        let id: u64 = id.parse().ok()?;
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(&id).cloned()
    }

    /// Remove the session from the table, returning the handle so the
    /// caller can terminate it without the registry lock held.
    pub fn destroy(&self, id: &str) -> Option<Arc<Session>> {
        let id: u64 = id.parse().ok()?;
        let mut inner = self.inner.lock().unwrap();
        let session = inner.sessions.remove(&id);
        if session.is_some() {
            info!("removed session {}", id);
        }
        session
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn cat() -> Option<Vec<String>> {
        Some(vec![String::from("/bin/cat")])
    }

    #[test]
    fn create_assigns_distinct_ascending_ids() {
        let registry = Registry::new();
        let a = registry.create(Some(String::from("a")), cat()).expect("create");
        let b = registry.create(Some(String::from("a")), cat()).expect("create");
        assert_ne!(a.id, b.id);
        assert!(b.id > a.id);

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);

        for session in listed {
            session.terminate();
        }
    }

    #[test]
    fn concurrent_creates_stay_unique() {
        let registry = Arc::new(Registry::new());

        let mut handles = vec![];
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry.create(None, cat()).expect("create").id
            }));
        }
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);

        for session in registry.list() {
            session.terminate();
        }
    }

    #[test]
    fn destroy_then_lookup_misses() {
        let registry = Registry::new();
        let session = registry.create(None, cat()).expect("create");
        let id = session.id.to_string();

        assert!(registry.lookup(&id).is_some());
        let removed = registry.destroy(&id).expect("destroy finds the session");
        removed.terminate();

        assert!(registry.lookup(&id).is_none());
        assert!(registry.destroy(&id).is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn lookup_tolerates_garbage_ids() {
        let registry = Registry::new();
        assert!(registry.lookup("bogus").is_none());
        assert!(registry.destroy("bogus").is_none());
    }

    #[test]
    fn failed_start_inserts_nothing() {
        let registry = Registry::new();
        let result =
            registry.create(None, Some(vec![]));
        assert!(result.is_err());
        assert!(registry.list().is_empty());

        // the id was not burned either
        let session = registry.create(None, cat()).expect("create");
        assert_eq!(session.id, 1);
        session.terminate();
    }
}
