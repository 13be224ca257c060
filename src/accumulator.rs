//! Folds a run's fragment stream into the parts of one agent message.
//!
//! Plain parts are appended in arrival order and replaced in place when a
//! fragment re-states a part with the same kind and id. Transform fragments
//! never become parts of their own: they wait in a FIFO queue until the text
//! they point at has arrived, then bind to the text part covering their
//! anchor. Text parts keep their raw text, and the text shown for a part is
//! recomputed from the raw text and the transforms bound to it, so a growing
//! text part keeps every edit already applied to it.

use std::collections::VecDeque;

use agent_protocol::{Part, PartKind, TextPart, Transform, TransformPart};

#[derive(Debug, Clone)]
enum Entry {
    Text { id: String, raw: String },
    Other(Part),
}

impl Entry {
    fn matches(&self, kind: PartKind, id: &str) -> bool {
        match self {
            Self::Text { id: existing, .. } => kind == PartKind::Text && existing == id,
            Self::Other(part) => part.kind() == kind && part.id() == Some(id),
        }
    }
}

/// Transform bound to a text part at a character offset into its raw text.
#[derive(Debug, Clone)]
struct Binding {
    part_id: String,
    offset: usize,
    transform: Transform,
}

impl Binding {
    fn inserted_len(&self) -> usize {
        self.transform.apply("", 0).chars().count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartAccumulator {
    entries: Vec<Entry>,
    queue: VecDeque<TransformPart>,
    bindings: Vec<Binding>,
}

impl PartAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one fragment in. Returns false when the fragment was dropped.
    pub fn push(&mut self, part: Part) -> bool {
        match part {
            Part::Unknown => false,
            Part::Transform(transform) => {
                self.queue.push_back(transform);
                self.bind_ready_transforms();
                true
            }
            Part::Text(TextPart { id, text }) => {
                let slot = self.position(PartKind::Text, &id);
                match slot {
                    Some(index) => self.entries[index] = Entry::Text { id, raw: text },
                    None => self.entries.push(Entry::Text { id, raw: text }),
                }
                self.bind_ready_transforms();
                true
            }
            other => {
                let slot = other
                    .id()
                    .and_then(|id| self.position(other.kind(), id));
                match slot {
                    Some(index) => self.entries[index] = Entry::Other(other),
                    None => self.entries.push(Entry::Other(other)),
                }
                true
            }
        }
    }

    pub fn extend(&mut self, parts: impl IntoIterator<Item = Part>) {
        for part in parts {
            self.push(part);
        }
    }

    /// Parts as they should be rendered: text parts carry their transformed text.
    #[must_use]
    pub fn parts(&self) -> Vec<Part> {
        self.entries
            .iter()
            .map(|entry| match entry {
                Entry::Text { id, raw } => Part::text(id.clone(), self.render_text(id, raw)),
                Entry::Other(part) => part.clone(),
            })
            .collect()
    }

    /// Concatenated rendered text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Entry::Text { id, raw } => Some(self.render_text(id, raw)),
                Entry::Other(_) => None,
            })
            .collect()
    }

    /// Transforms still waiting for the text they anchor to.
    #[must_use]
    pub fn pending_transforms(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.queue.is_empty()
    }

    fn position(&self, kind: PartKind, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.matches(kind, id))
    }

    fn bind_ready_transforms(&mut self) {
        while let Some(head) = self.queue.front() {
            let Some((part_id, offset)) = self.locate(head.start_index) else {
                break;
            };
            if let Some(head) = self.queue.pop_front() {
                self.bindings.push(Binding {
                    part_id,
                    offset,
                    transform: head.transform,
                });
            }
        }
    }

    /// Finds the text part covering character `index` of the concatenated raw
    /// text, or the last text part when `index` is the end of non-empty text.
    fn locate(&self, index: usize) -> Option<(String, usize)> {
        let mut start = 0;
        let mut last_non_empty = None;

        for entry in &self.entries {
            let Entry::Text { id, raw } = entry else {
                continue;
            };
            let len = raw.chars().count();
            if index < start + len {
                return Some((id.clone(), index - start));
            }
            if len > 0 {
                last_non_empty = Some((id, len));
            }
            start += len;
        }

        match last_non_empty {
            Some((id, len)) if index == start => Some((id.clone(), len)),
            _ => None,
        }
    }

    fn render_text(&self, part_id: &str, raw: &str) -> String {
        let bound: Vec<&Binding> = self
            .bindings
            .iter()
            .filter(|binding| binding.part_id == part_id)
            .collect();

        let mut content = raw.to_string();
        for (position, binding) in bound.iter().enumerate() {
            let shift: usize = bound[..position]
                .iter()
                .filter(|earlier| earlier.transform.anchor(earlier.offset) <= binding.offset)
                .map(|earlier| earlier.inserted_len())
                .sum();
            content = binding.transform.apply(&content, binding.offset + shift);
        }
        content
    }
}
