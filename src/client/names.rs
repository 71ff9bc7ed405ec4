//! Display names for client selection lists.

use std::collections::{HashMap, HashSet};

use super::Client;
use crate::mapping::ClientMappingDatabase;
use crate::transport::RemoteId;

/// Label of the "no client" entry.
pub const NOT_ASSIGNED_LABEL: &str = "None";

/// Makes repeated names distinct: `"iPhone"`, `"iPhone (1)"`, `"iPhone (2)"`.
///
/// Labels are never handed out twice, even when a client's own name looks
/// like a generated one.
#[derive(Debug, Default)]
pub struct UniqueNameFormatter {
    next_suffix: HashMap<String, usize>,
    used: HashSet<String>,
}

impl UniqueNameFormatter {
    /// Create a formatter with no names seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `name`, suffixed if it was returned before.
    pub fn format(&mut self, name: &str) -> String {
        let suffix = self.next_suffix.entry(name.to_string()).or_insert(0);
        loop {
            let formatted = if *suffix == 0 {
                name.to_string()
            } else {
                format!("{name} ({suffix})")
            };
            *suffix += 1;
            if self.used.insert(formatted.clone()) {
                return formatted;
            }
        }
    }
}

/// One entry of a client selection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOption {
    /// Text shown to the user.
    pub label: String,
    /// Client selected by this entry; `None` clears the device.
    pub client: Option<RemoteId>,
}

/// Build the selection list for a device whose client is `current`.
///
/// The first entry clears the assignment. Paired clients are marked
/// `(Current)` when they feed this device and `(In Use)` otherwise.
pub fn client_options<'a, I>(
    clients: I,
    current: Option<RemoteId>,
    mapping: &ClientMappingDatabase,
) -> Vec<ClientOption>
where
    I: IntoIterator<Item = &'a Client>,
{
    let mut formatter = UniqueNameFormatter::new();
    let mut options = vec![ClientOption {
        label: NOT_ASSIGNED_LABEL.to_string(),
        client: None,
    }];

    for client in clients {
        let mut name = client.name().to_string();
        if mapping.try_get_device(client.id()).is_some() {
            if Some(client.id()) == current {
                name.push_str(" (Current)");
            } else {
                name.push_str(" (In Use)");
            }
        }
        options.push(ClientOption {
            label: formatter.format(&name),
            client: Some(client.id()),
        });
    }

    options
}
