//! Collects diagnostics from parallel passes. Errors like undefined
//! references accumulate across the whole link and get reported together, in
//! deterministic order, rather than aborting at the first one.

use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crossbeam_queue::SegQueue;
use itertools::Itertools as _;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[derive(Default)]
pub(crate) struct Diagnostics {
    errors: SegQueue<Message>,
    warnings: SegQueue<Message>,
    num_errors: AtomicUsize,
}

struct Message {
    /// Used to order messages deterministically regardless of which thread
    /// produced them first.
    sort_key: (u64, u64),
    text: String,
}

impl Diagnostics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.num_errors.load(Ordering::Relaxed) > 0
    }

    fn push_error(&self, sort_key: (u64, u64), text: String) {
        self.num_errors.fetch_add(1, Ordering::Relaxed);
        self.errors.push(Message { sort_key, text });
    }

    pub(crate) fn warning(&self, sort_key: (u64, u64), text: String) {
        self.warnings.push(Message { sort_key, text });
    }

    pub(crate) fn undefined_symbol(&self, symbol_db: &SymbolDb<'_>, id: SymbolId) {
        let file = symbol_db.file(symbol_db.file_id_for_symbol(id));
        let location = file
            .object()
            .map(|o| o.input.to_string())
            .unwrap_or_else(|| "<internal>".to_owned());
        self.push_error(
            (id.as_usize() as u64, 0),
            format!(
                "undefined symbol: {}\n>>> referenced by {location}",
                symbol_db.symbol_name_for_display(id)
            ),
        );
    }

    pub(crate) fn multiple_definition(&self, symbol_db: &SymbolDb<'_>, definitions: &[SymbolId]) {
        let Some(&id) = definitions.first() else {
            return;
        };
        let files = definitions
            .iter()
            .map(|&d| {
                symbol_db
                    .file(symbol_db.file_id_for_symbol(d))
                    .object()
                    .map(|o| format!(">>> defined in {}", o.input))
                    .unwrap_or_else(|| ">>> defined internally".to_owned())
            })
            .join("\n");
        self.push_error(
            (id.as_usize() as u64, 1),
            format!(
                "duplicate symbol: {}\n{files}",
                symbol_db.symbol_name_for_display(id)
            ),
        );
    }

    pub(crate) fn relocation_error(
        &self,
        file: String,
        section: String,
        offset: u64,
        message: String,
    ) {
        self.push_error(
            (offset, 2),
            format!("relocation error in {file}, section {section}, offset 0x{offset:x}: {message}"),
        );
    }

    /// Emits accumulated warnings (sorted) and returns an error report if
    /// any errors accumulated. With `fatal_warnings`, warnings join the
    /// error report instead of being printed.
    pub(crate) fn finish(&self, fatal_warnings: bool) -> Option<String> {
        let warnings = drain_sorted(&self.warnings);
        let mut errors = drain_sorted(&self.errors);
        if fatal_warnings {
            errors.extend(warnings);
        } else {
            for warning in warnings {
                crate::warn!("{}", warning);
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("\n"))
        }
    }
}

fn drain_sorted(queue: &SegQueue<Message>) -> Vec<String> {
    let mut messages = Vec::with_capacity(queue.len());
    while let Some(message) = queue.pop() {
        messages.push(message);
    }
    messages.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.text.cmp(&b.text)));
    messages.into_iter().map(|m| m.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_sorted_deterministically() {
        let diagnostics = Diagnostics::new();
        diagnostics.push_error((5, 0), "b".to_owned());
        diagnostics.push_error((1, 0), "a".to_owned());
        assert!(diagnostics.has_errors());
        let report = diagnostics.finish(false).unwrap();
        assert_eq!(report, "a\nb");
    }

    #[test]
    fn test_no_errors() {
        let diagnostics = Diagnostics::new();
        assert!(!diagnostics.has_errors());
        assert!(diagnostics.finish(false).is_none());
    }
}
