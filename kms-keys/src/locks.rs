//! Striped async locks keyed by tenant and name
// Copyright 2025 Francisco F. Pinochet
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


use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

pub(crate) const DEFAULT_STRIPES: usize = 64;

/// Fixed set of mutexes; a `(tenant, name)` pair always maps to the same one.
///
/// Unrelated names may share a stripe, so a holder must never take a second
/// lock from the same set.
pub(crate) struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, tenant_id: &str, name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        (tenant_id, name).hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    pub(crate) async fn lock(&self, tenant_id: &str, name: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(tenant_id, name)].lock().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
