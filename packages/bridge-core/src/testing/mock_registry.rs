//! Token registry with settable per-token status

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{eyre, Result};

use crate::registration::{RegistrationStatus, TokenRegistry};

#[derive(Default)]
pub struct MockTokenRegistry {
    statuses: Mutex<HashMap<Address, RegistrationStatus>>,
    unavailable: Mutex<bool>,
    calls: AtomicU32,
}

impl MockTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, token: Address, status: RegistrationStatus) {
        self.statuses.lock().unwrap().insert(token, status);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn status_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRegistry for MockTokenRegistry {
    async fn registration_status(&self, token: Address) -> Result<RegistrationStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock().unwrap() {
            return Err(eyre!("execution reverted: registry paused"));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&token)
            .copied()
            .unwrap_or(RegistrationStatus::Unregistered))
    }
}
