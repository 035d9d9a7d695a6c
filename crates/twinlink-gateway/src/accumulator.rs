use std::time::SystemTime;

use hashbrown::DefaultHashBuilder;

use indexmap::map::{Entry, IndexMap};

use twinlink::notification::{
    DataNotification, LifecycleNotification, LifecycleStatus, MetadataNotification, Notification,
    NotificationKind, NotificationTarget,
};
use twinlink::value::{DataType, Metadata, TimedValue};

enum Pending {
    Lifecycle(Vec<LifecycleNotification>),
    Data(DataNotification),
    Metadata(MetadataNotification),
}

/// Collects the notifications produced by a single command.
///
/// Events concerning the same element and of the same kind are coalesced,
/// and the result keeps the order in which each element first changed.
#[derive(Default)]
pub(crate) struct NotificationAccumulator {
    pending: IndexMap<(String, NotificationKind), Pending, DefaultHashBuilder>,
}

impl NotificationAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lifecycle(
        &mut self,
        target: NotificationTarget,
        status: LifecycleStatus,
        initial: Option<(&TimedValue, &Metadata)>,
    ) {
        let topic = target.topic();
        let notification = LifecycleNotification {
            target,
            status,
            initial_value: initial.map(|(value, _)| value.clone()),
            initial_metadata: initial.map(|(_, metadata)| metadata.clone()),
        };

        let key = (topic.clone(), NotificationKind::Lifecycle);
        let Some(Pending::Lifecycle(statuses)) = self.pending.get_mut(&key) else {
            let _ = self
                .pending
                .insert(key, Pending::Lifecycle(vec![notification]));
            return;
        };

        match statuses.last().map(|last| last.status) {
            Some(last) if last == status => {
                let _ = statuses.pop();
                statuses.push(notification);
            }
            Some(last) if status.is_deleted() && last.is_created() => {
                // The element never became visible outside the command.
                let _ = statuses.pop();
                if statuses.is_empty() {
                    let _ = self.pending.shift_remove(&key);
                    let _ = self
                        .pending
                        .shift_remove(&(topic.clone(), NotificationKind::Data));
                    let _ = self
                        .pending
                        .shift_remove(&(topic, NotificationKind::Metadata));
                }
            }
            _ => statuses.push(notification),
        }
    }

    pub(crate) fn data(
        &mut self,
        target: NotificationTarget,
        data_type: DataType,
        old: &TimedValue,
        new: &TimedValue,
        metadata: &Metadata,
    ) {
        let key = (target.topic(), NotificationKind::Data);
        match self.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                let Pending::Data(pending) = entry.get_mut() else {
                    return;
                };
                let out_of_order = matches!(
                    (pending.timestamp, new.timestamp()),
                    (Some(current), Some(next)) if next < current
                );
                if !out_of_order {
                    pending.new_value = new.value().cloned();
                    pending.timestamp = new.timestamp();
                    pending.metadata = metadata.clone();
                }
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(Pending::Data(DataNotification {
                    target,
                    data_type,
                    old_value: old.value().cloned(),
                    new_value: new.value().cloned(),
                    timestamp: new.timestamp(),
                    metadata: metadata.clone(),
                }));
            }
        }
    }

    pub(crate) fn metadata(
        &mut self,
        target: NotificationTarget,
        old: Metadata,
        new: &Metadata,
        timestamp: SystemTime,
    ) {
        let key = (target.topic(), NotificationKind::Metadata);
        match self.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Pending::Metadata(pending) = entry.get_mut() {
                    pending.new_metadata = new.clone();
                    pending.timestamp = Some(timestamp);
                }
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(Pending::Metadata(MetadataNotification {
                    target,
                    old_metadata: old,
                    new_metadata: new.clone(),
                    timestamp: Some(timestamp),
                }));
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn into_notifications(self) -> Vec<Notification> {
        let mut notifications = Vec::with_capacity(self.pending.len());
        for pending in self.pending.into_values() {
            match pending {
                Pending::Lifecycle(statuses) => {
                    notifications.extend(statuses.into_iter().map(Notification::Lifecycle));
                }
                Pending::Data(data) => notifications.push(Notification::Data(data)),
                Pending::Metadata(metadata) => notifications.push(Notification::Metadata(metadata)),
            }
        }
        notifications
    }
}
