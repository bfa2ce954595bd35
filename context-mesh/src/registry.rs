//! Subscriber registry keyed by context type.

use crate::types::{ContextHandler, ContextSubscription, SubscriptionId};
use mesh_store::ContextType;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A registered handler.
pub(crate) struct Subscriber {
    pub id: SubscriptionId,
    pub module_name: String,
    pub handler: Arc<dyn ContextHandler>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<ContextType, Vec<Arc<Subscriber>>>,
    index: HashMap<SubscriptionId, Vec<ContextType>>,
}

/// Holds subscriptions in registration order per context type.
///
/// Buckets and the id index sit behind one lock so removal is atomic across
/// every type a subscription listens to.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    inner: RwLock<Inner>,
}

impl SubscriberRegistry {
    pub fn insert(&self, subscription: ContextSubscription) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let subscriber = Arc::new(Subscriber {
            id: id.clone(),
            module_name: subscription.module_name,
            handler: subscription.handler,
        });

        let mut types = Vec::with_capacity(subscription.context_types.len());
        for context_type in subscription.context_types {
            if !types.contains(&context_type) {
                types.push(context_type);
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for context_type in &types {
            inner
                .buckets
                .entry(*context_type)
                .or_default()
                .push(Arc::clone(&subscriber));
        }
        inner.index.insert(id.clone(), types);
        id
    }

    /// Remove a subscription from every bucket. Returns the subscriber module.
    pub fn remove(&self, id: &SubscriptionId) -> Option<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let types = inner.index.remove(id)?;

        let mut module_name = None;
        for context_type in types {
            if let Some(bucket) = inner.buckets.get_mut(&context_type) {
                if let Some(pos) = bucket.iter().position(|s| &s.id == id) {
                    module_name = Some(bucket.remove(pos).module_name.clone());
                }
                if bucket.is_empty() {
                    inner.buckets.remove(&context_type);
                }
            }
        }
        module_name
    }

    /// Snapshot of handlers for a type, in registration order.
    pub fn subscribers_for(&self, context_type: ContextType) -> Vec<Arc<Subscriber>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .buckets
            .get(&context_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every subscription. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.index.len();
        inner.buckets.clear();
        inner.index.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .len()
    }
}
