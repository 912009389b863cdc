use crate::ids::{DeviceId, UserId};
use crate::prekeys::RecipientMap;
use parley_api::types::{ClientMismatch, UserClients};

/// Applies a stale-recipients diff to the sender's last known recipient
/// set: `deleted` and `redundant` devices go, `missing` devices come in.
/// The caller builds a fresh envelope from the result; the original
/// payloads are discarded, never resent.
pub fn reconcile(diff: &ClientMismatch, recipients: &RecipientMap) -> RecipientMap {
    let mut corrected = recipients.clone();
    remove_all(&mut corrected, &diff.deleted);
    remove_all(&mut corrected, &diff.redundant);
    for entry in diff.missing.iter() {
        let user = UserId::from(&entry.user);
        let devices = corrected.entry(user).or_default();
        for client in entry.clients.iter() {
            let device = DeviceId::from(client);
            if !devices.contains(&device) {
                devices.push(device);
            }
        }
    }
    corrected.retain(|_, devices| !devices.is_empty());
    corrected
}

fn remove_all(recipients: &mut RecipientMap, entries: &[UserClients]) {
    for entry in entries.iter() {
        let user = UserId::from(&entry.user);
        if let Some(devices) = recipients.get_mut(&user) {
            devices.retain(|device| {
                !entry
                    .clients
                    .iter()
                    .any(|client| DeviceId::from(client) == *device)
            });
        }
    }
}
