//! Per-relay subscription grouping
//!
//! Subscriptions created within a short window whose filters share a
//! fingerprint are merged into a single REQ on each relay. A group walks
//! `Initial -> Pending -> Running -> Closed`, parking in `Waiting` while the
//! relay is offline.

use crate::error::{ClientError, Result};
use crate::filter::merge_filter_lists;
use crate::message::Filter;
use crate::relay::Relay;
use crate::status::RelayStatus;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Receives relay-level subscription signals for one grouped item.
pub trait RelaySubscriber: Send + Sync {
    fn on_eose(&self, relay: &Relay);
    fn on_closed(&self, relay: &Relay, reason: &str);
}

/// How a group's send deadline reacts to a new member's delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupableDelayType {
    /// Wait at least this long; the group fires at the latest deadline
    AtLeast,
    /// Wait at most this long; the group fires at the earliest deadline
    #[default]
    AtMost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Initial,
    Pending,
    Waiting,
    Running,
    Closed,
}

/// One subscription's share of a relay request.
pub struct SubscriptionItem {
    pub subscriber: Weak<dyn RelaySubscriber>,
    pub internal_id: u64,
    pub filters: Vec<Filter>,
    /// `None` keeps the item in a group of its own
    pub fingerprint: Option<String>,
    pub groupable: bool,
    pub delay: Duration,
    pub delay_type: GroupableDelayType,
    /// Caller-chosen subscription id prefix
    pub sub_id: Option<String>,
}

struct RelayGroup {
    fingerprint: Option<String>,
    status: GroupStatus,
    items: IndexMap<u64, SubscriptionItem>,
    sub_id: Option<String>,
    eosed: bool,
    fire_at: Option<Instant>,
    delay_type: GroupableDelayType,
    timer: Option<JoinHandle<()>>,
    reexecute_after_auth: bool,
    close_at_eose: bool,
}

impl RelayGroup {
    fn new(fingerprint: Option<String>) -> Self {
        Self {
            fingerprint,
            status: GroupStatus::Initial,
            items: IndexMap::new(),
            sub_id: None,
            eosed: false,
            fire_at: None,
            delay_type: GroupableDelayType::AtMost,
            timer: None,
            reexecute_after_auth: false,
            close_at_eose: false,
        }
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.fire_at = None;
    }

    fn subscribers(&self) -> Vec<std::sync::Arc<dyn RelaySubscriber>> {
        self.items
            .values()
            .filter_map(|item| item.subscriber.upgrade())
            .collect()
    }

    fn build_sub_id(&self) -> String {
        let hints: Vec<String> = self
            .items
            .values()
            .filter_map(|item| item.sub_id.as_deref())
            .map(|hint| hint.chars().take(10).collect())
            .collect();

        let prefix = if !hints.is_empty() {
            hints.join("-").chars().take(20).collect()
        } else if let Some(fingerprint) = self.fingerprint.as_deref().filter(|f| !f.is_empty()) {
            fingerprint.chars().take(15).collect()
        } else {
            "sub".to_string()
        };

        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
        format!("{}-{}", prefix, suffix)
    }
}

/// Grouping bookkeeping for one relay.
#[derive(Default)]
pub(crate) struct GroupingState {
    groups: HashMap<u64, RelayGroup>,
    /// Groups still accepting members
    by_fingerprint: HashMap<String, u64>,
    by_sub_id: HashMap<String, u64>,
    by_item: HashMap<u64, u64>,
    next_id: u64,
    /// Superseded sub ids to close once their EOSE arrives
    abandoned: HashSet<String>,
}

impl GroupingState {
    fn forget_fingerprint(&mut self, group_id: u64) {
        if let Some(fingerprint) = self.groups.get(&group_id).and_then(|g| g.fingerprint.clone())
            && self.by_fingerprint.get(&fingerprint) == Some(&group_id)
        {
            self.by_fingerprint.remove(&fingerprint);
        }
    }

    fn remove_group(&mut self, group_id: u64) -> Option<RelayGroup> {
        self.forget_fingerprint(group_id);
        let mut group = self.groups.remove(&group_id)?;
        group.abort_timer();
        if let Some(sub_id) = &group.sub_id {
            self.by_sub_id.remove(sub_id);
        }
        for item_id in group.items.keys() {
            self.by_item.remove(item_id);
        }
        group.status = GroupStatus::Closed;
        Some(group)
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }

    #[cfg(test)]
    pub(crate) fn status_of(&self, item_id: u64) -> Option<GroupStatus> {
        let group_id = self.by_item.get(&item_id)?;
        self.groups.get(group_id).map(|g| g.status)
    }
}

/// Whether a new deadline should replace the group's current one.
fn should_reschedule(
    current: Instant,
    current_type: GroupableDelayType,
    candidate: Instant,
    candidate_type: GroupableDelayType,
) -> bool {
    match (current_type, candidate_type) {
        (GroupableDelayType::AtLeast, GroupableDelayType::AtLeast) => current < candidate,
        _ => current > candidate,
    }
}

impl Relay {
    /// Attach a subscription to this relay, grouping it with compatible
    /// pending subscriptions.
    pub(crate) fn add_subscription_item(&self, item: SubscriptionItem) -> Result<()> {
        let item_id = item.internal_id;
        let groupable = item.groupable && item.fingerprint.is_some() && !item.delay.is_zero();
        let delay = item.delay;
        let delay_type = item.delay_type;

        let execute_now = {
            let mut state = self.inner.groups.lock();
            if state.by_item.contains_key(&item_id) {
                debug!("Subscription {} already attached to {}", item_id, self.url());
                return Ok(());
            }

            let existing = if groupable {
                item.fingerprint
                    .as_ref()
                    .and_then(|f| state.by_fingerprint.get(f).copied())
            } else {
                None
            };

            let group_id = match existing {
                Some(id) => id,
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.groups.insert(id, RelayGroup::new(item.fingerprint.clone()));
                    if groupable && let Some(fingerprint) = &item.fingerprint {
                        state.by_fingerprint.insert(fingerprint.clone(), id);
                    }
                    id
                }
            };

            let Some(group) = state.groups.get_mut(&group_id) else {
                return Err(ClientError::Subscription("subscription group vanished".to_string()));
            };
            if group.status == GroupStatus::Closed {
                return Err(ClientError::Subscription(
                    "Cannot add new items to a closed subscription".to_string(),
                ));
            }
            group.items.insert(item_id, item);
            state.by_item.insert(item_id, group_id);

            if groupable {
                self.schedule_group(&mut state, group_id, delay, delay_type);
                None
            } else {
                Some(group_id)
            }
        };

        if let Some(group_id) = execute_now {
            self.execute_group(group_id);
        }
        Ok(())
    }

    fn schedule_group(
        &self,
        state: &mut GroupingState,
        group_id: u64,
        delay: Duration,
        delay_type: GroupableDelayType,
    ) {
        let Some(group) = state.groups.get_mut(&group_id) else {
            return;
        };
        let candidate = Instant::now() + delay;

        if let Some(current) = group.fire_at
            && !should_reschedule(current, group.delay_type, candidate, delay_type)
        {
            return;
        }

        group.abort_timer();
        group.fire_at = Some(candidate);
        group.delay_type = delay_type;
        group.status = GroupStatus::Pending;

        let relay = self.downgrade();
        group.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(candidate).await;
            if let Some(relay) = relay.upgrade() {
                relay.execute_group(group_id);
            }
        }));
    }

    /// Send the group's REQ, or park it until the relay is ready.
    fn execute_group(&self, group_id: u64) {
        let request = {
            let mut state = self.inner.groups.lock();
            state.forget_fingerprint(group_id);
            let status = self.status();
            let Some(group) = state.groups.get_mut(&group_id) else {
                return;
            };
            if !matches!(
                group.status,
                GroupStatus::Initial | GroupStatus::Pending | GroupStatus::Waiting
            ) {
                return;
            }
            group.timer.take();
            group.fire_at = None;

            if !status.is_connected() {
                trace!("Relay {} not ready, group {} waits", self.url(), group_id);
                group.status = GroupStatus::Waiting;
                return;
            }
            if status < RelayStatus::Authenticated {
                group.reexecute_after_auth = true;
            }

            let sub_id = group.build_sub_id();
            let filters = merge_filter_lists(group.items.values().map(|i| i.filters.as_slice()));
            group.status = GroupStatus::Running;
            group.sub_id = Some(sub_id.clone());
            group.eosed = false;
            group.close_at_eose = false;
            state.by_sub_id.insert(sub_id.clone(), group_id);
            (sub_id, filters)
        };

        let (sub_id, filters) = request;
        debug!("Executing subscription {} on {}", sub_id, self.url());
        if let Err(e) = self.req(&sub_id, filters) {
            debug!("REQ {} to {} failed: {}", sub_id, self.url(), e);
            let mut state = self.inner.groups.lock();
            state.by_sub_id.remove(&sub_id);
            if let Some(group) = state.groups.get_mut(&group_id) {
                group.status = GroupStatus::Waiting;
                group.sub_id = None;
            }
        }
    }

    /// Detach a subscription. Emptied groups are cancelled before their REQ
    /// goes out, closed at once after EOSE, or closed when EOSE arrives.
    pub(crate) fn remove_subscription_item(&self, item_id: u64) {
        let close = {
            let mut state = self.inner.groups.lock();
            let Some(group_id) = state.by_item.remove(&item_id) else {
                return;
            };
            let Some(group) = state.groups.get_mut(&group_id) else {
                return;
            };
            group.items.shift_remove(&item_id);
            if !group.items.is_empty() {
                return;
            }

            match group.status {
                GroupStatus::Running if !group.eosed => {
                    group.close_at_eose = true;
                    None
                }
                GroupStatus::Running => state.remove_group(group_id).and_then(|g| g.sub_id),
                _ => {
                    state.remove_group(group_id);
                    None
                }
            }
        };

        if let Some(sub_id) = close {
            self.close_subscription(&sub_id);
        }
    }

    pub(crate) fn on_subscription_event(&self, sub_id: &str, event: nostr::Event) {
        let known = {
            let state = self.inner.groups.lock();
            state.by_sub_id.contains_key(sub_id) || state.abandoned.contains(sub_id)
        };
        if !known {
            trace!("Event for unknown subscription {} from {}", sub_id, self.url());
            return;
        }

        if let Some(manager) = self.manager() {
            manager.dispatch_event(event, Some(self), false);
        }
    }

    pub(crate) fn on_subscription_eose(&self, sub_id: &str) {
        let (subscribers, close) = {
            let mut state = self.inner.groups.lock();
            if state.abandoned.remove(sub_id) {
                (Vec::new(), true)
            } else {
                let Some(&group_id) = state.by_sub_id.get(sub_id) else {
                    trace!("EOSE for unknown subscription {} from {}", sub_id, self.url());
                    return;
                };
                let Some(group) = state.groups.get_mut(&group_id) else {
                    return;
                };
                group.eosed = true;
                if group.close_at_eose {
                    state.remove_group(group_id);
                    (Vec::new(), true)
                } else {
                    (group.subscribers(), false)
                }
            }
        };

        if close {
            self.close_subscription(sub_id);
        }
        for subscriber in subscribers {
            subscriber.on_eose(self);
        }
    }

    pub(crate) fn on_subscription_closed(&self, sub_id: &str, reason: &str) {
        let subscribers = {
            let mut state = self.inner.groups.lock();
            if state.abandoned.remove(sub_id) {
                return;
            }
            let Some(group_id) = state.by_sub_id.get(sub_id).copied() else {
                return;
            };
            match state.remove_group(group_id) {
                Some(group) => group.subscribers(),
                None => return,
            }
        };

        for subscriber in subscribers {
            subscriber.on_closed(self, reason);
        }
    }

    pub(crate) fn execute_waiting_groups(&self) {
        let waiting: Vec<u64> = {
            let state = self.inner.groups.lock();
            state
                .groups
                .iter()
                .filter(|(_, g)| g.status == GroupStatus::Waiting)
                .map(|(id, _)| *id)
                .collect()
        };
        for group_id in waiting {
            self.execute_group(group_id);
        }
    }

    /// Running groups go back to waiting; they are re-sent on reconnect.
    pub(crate) fn on_connection_lost(&self) {
        let mut state = self.inner.groups.lock();
        state.abandoned.clear();
        state.by_sub_id.clear();

        let ids: Vec<u64> = state.groups.keys().copied().collect();
        for group_id in ids {
            let Some(group) = state.groups.get_mut(&group_id) else {
                continue;
            };
            if group.status != GroupStatus::Running {
                continue;
            }
            if group.items.is_empty() {
                state.remove_group(group_id);
                continue;
            }
            group.status = GroupStatus::Waiting;
            group.sub_id = None;
            group.eosed = false;
            group.close_at_eose = false;
        }
    }

    /// Groups sent before authentication are re-issued under a new id.
    pub(crate) fn on_authenticated(&self) {
        let (close_now, rerun) = {
            let mut state = self.inner.groups.lock();
            let mut close_now = Vec::new();
            let mut abandoned = Vec::new();
            let mut rerun = Vec::new();

            for (id, group) in state.groups.iter_mut() {
                if group.status != GroupStatus::Running || !group.reexecute_after_auth {
                    continue;
                }
                group.reexecute_after_auth = false;
                if group.items.is_empty() {
                    continue;
                }
                if let Some(old) = group.sub_id.take() {
                    if group.eosed {
                        close_now.push(old);
                    } else {
                        abandoned.push(old);
                    }
                }
                group.status = GroupStatus::Waiting;
                rerun.push(*id);
            }

            for sub_id in close_now.iter().chain(abandoned.iter()) {
                state.by_sub_id.remove(sub_id);
            }
            state.abandoned.extend(abandoned);
            (close_now, rerun)
        };

        for sub_id in close_now {
            self.close_subscription(&sub_id);
        }
        for group_id in rerun {
            debug!("Re-executing group {} on {} after auth", group_id, self.url());
            self.execute_group(group_id);
        }
    }

    /// Number of live subscription groups on this relay.
    pub fn subscription_group_count(&self) -> usize {
        self.inner.groups.lock().len()
    }
}
