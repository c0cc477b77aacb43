//! Service queues.

use parlor_proto::{Props, Result};

/// A queue guests can join to reach an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    /// Queue id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the queue currently refuses new audience.
    pub closed: bool,
    /// Whether guests may upload files in channels from this queue.
    pub upload: bool,
}

impl Queue {
    /// Parse the `realm_queues` object of a `realm_queues_found` event.
    ///
    /// Queues without a name fall back to their id. The result is sorted by
    /// id.
    pub fn list_from_props(props: &Props) -> Result<Vec<Queue>> {
        let realm_queues = props.require_object("realm_queues")?;
        let mut queues: Vec<Queue> = realm_queues
            .objects()
            .map(|(id, queue)| {
                let attrs = queue.object("queue_attrs").unwrap_or_default();
                Queue {
                    id: id.to_owned(),
                    name: attrs.str("name").unwrap_or(id).to_owned(),
                    closed: attrs.flag("closed"),
                    upload: attrs.str("upload").is_some_and(|value| value == "member"),
                }
            })
            .collect();
        queues.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(queues)
    }

    /// Queues offered to the guest.
    ///
    /// With an allow-list, the allowed queues present in `queues`, in
    /// allow-list order; otherwise every queue.
    pub fn audience(queues: &[Queue], allow: Option<&[String]>) -> Vec<Queue> {
        match allow {
            Some(ids) => ids.iter().filter_map(|id| queues.iter().find(|q| &q.id == id).cloned()).collect(),
            None => queues.to_vec(),
        }
    }
}
