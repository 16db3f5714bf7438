// Post-mutation notifications
// Listeners run after the ledger write has committed

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use super::ledger::{AccountId, OrderRef};
use super::types::EntryType;

/// Something that just happened to a balance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Credited {
        account_id: AccountId,
        points: i64,
        entry_type: EntryType,
        balance: i64,
        order_ref: Option<OrderRef>,
    },
    Debited {
        account_id: AccountId,
        points: i64,
        entry_type: EntryType,
        balance: i64,
        order_ref: Option<OrderRef>,
    },
    Earned {
        account_id: AccountId,
        order_ref: OrderRef,
        points: i64,
    },
    Redeemed {
        account_id: AccountId,
        order_ref: OrderRef,
        points: i64,
        discount: Decimal,
    },
    Expired {
        account_id: AccountId,
        source_entry_id: i64,
        points: i64,
    },
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Fan-out to registered listeners
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Vec<Listener>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    pub fn emit(&self, notification: Notification) {
        tracing::debug!(?notification, "loyalty notification");
        for listener in &self.listeners {
            listener(&notification);
        }
    }
}
