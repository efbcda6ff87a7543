use bitflags::bitflags;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

bitflags! {
    /// Information about a symbol's value together with the kinds of access
    /// that relocations have requested for it. The first group comes from
    /// the defining object; the second group is accumulated while scanning
    /// relocations during layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct ValueFlags: u32 {
        /// An absolute value that doesn't change with the load address. Also
        /// set for undefined weak symbols, which resolve to 0 everywhere.
        const ABSOLUTE = 1 << 0;

        /// The value lives in a shared object, so the actual address isn't
        /// known until runtime.
        const DYNAMIC = 1 << 1;

        /// The value refers to an ifunc; the address is computed at runtime.
        const IFUNC = 1 << 2;

        /// The definition cannot be interposed at runtime (local, hidden,
        /// or linking a non-interposable output).
        const CAN_BYPASS_GOT = 1 << 3;

        /// A version script downgraded this global to local visibility.
        const DOWNGRADE_TO_LOCAL = 1 << 4;

        /// The symbol is a function (used for dynamic symbols and PLT-via-GOT
        /// decisions).
        const FUNCTION = 1 << 5;

        /// The symbol's value is a thread-local offset.
        const TLS = 1 << 6;

        // -- request flags, set during the layout relocation scan --

        /// Referenced directly (relative or absolute relocation).
        const DIRECT = 1 << 7;

        /// A GOT entry holding the symbol's address is needed.
        const GOT = 1 << 8;

        /// A PLT entry is needed.
        const PLT = 1 << 9;

        /// A (module, offset) GOT entry pair is needed (TLS general dynamic).
        const GOT_TLS_MODULE = 1 << 10;

        /// A GOT entry holding a TP-relative offset is needed (initial exec).
        const GOT_TLS_OFFSET = 1 << 11;

        /// A TLS descriptor GOT entry pair is needed.
        const GOT_TLS_DESCRIPTOR = 1 << 12;

        /// The symbol must appear in the dynamic symbol table.
        const EXPORT_DYNAMIC = 1 << 13;

        /// Referenced directly from a non-writable section while defined in
        /// a shared object, so a copy relocation is required.
        const COPY_RELOCATION = 1 << 14;

        /// Some defining occurrence of the symbol has protected visibility.
        const VISIBILITY_PROTECTED = 1 << 15;

        /// Some defining occurrence has hidden (or internal) visibility.
        /// Visibility strengthens monotonically, so hidden wins over
        /// protected wins over default among all definitions of a name.
        const VISIBILITY_HIDDEN = 1 << 16;
    }
}

impl ValueFlags {
    /// Merges in the flags of a non-canonical definition of the same symbol.
    /// Non-interposability and visibility restrictions carry over: the most
    /// restrictive visibility among all defining occurrences wins, even when
    /// the restrictive occurrence isn't the chosen definition.
    pub(crate) fn merge(&mut self, other: ValueFlags) {
        *self |= other
            & (ValueFlags::CAN_BYPASS_GOT
                | ValueFlags::VISIBILITY_PROTECTED
                | ValueFlags::VISIBILITY_HIDDEN);
    }

    /// Whether the symbol may appear in the dynamic symbol table. Hidden and
    /// internal visibility suppress export; protected does not.
    pub(crate) fn is_exportable(self) -> bool {
        !self.contains(ValueFlags::VISIBILITY_HIDDEN)
    }

    /// The `st_other` visibility bits for an exported symbol.
    pub(crate) fn st_visibility(self) -> u8 {
        if self.contains(ValueFlags::VISIBILITY_HIDDEN) {
            object::elf::STV_HIDDEN
        } else if self.contains(ValueFlags::VISIBILITY_PROTECTED) {
            object::elf::STV_PROTECTED
        } else {
            object::elf::STV_DEFAULT
        }
    }
}

/// Per-symbol flags that support concurrent merging during the parallel
/// relocation scan.
pub(crate) struct AtomicValueFlags {
    raw: AtomicU32,
}

impl AtomicValueFlags {
    pub(crate) fn new(flags: ValueFlags) -> Self {
        Self {
            raw: AtomicU32::new(flags.bits()),
        }
    }

    /// Sets the supplied flags, returning the flags that were already set.
    pub(crate) fn fetch_or(&self, flags: ValueFlags) -> ValueFlags {
        // Relaxed is fine: flag accumulation is commutative and the layout
        // stage ends with a barrier before anyone reads the totals.
        ValueFlags::from_bits_retain(self.raw.fetch_or(flags.bits(), Ordering::Relaxed))
    }

    pub(crate) fn get(&self) -> ValueFlags {
        ValueFlags::from_bits_retain(self.raw.load(Ordering::Relaxed))
    }

    pub(crate) fn into_inner(self) -> ValueFlags {
        ValueFlags::from_bits_retain(self.raw.into_inner())
    }
}

impl Clone for AtomicValueFlags {
    fn clone(&self) -> Self {
        Self {
            raw: AtomicU32::new(self.raw.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for AtomicValueFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.get().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_propagates_bypass_and_visibility() {
        let mut flags = ValueFlags::ABSOLUTE;
        flags.merge(ValueFlags::CAN_BYPASS_GOT | ValueFlags::GOT);
        assert!(flags.contains(ValueFlags::CAN_BYPASS_GOT));
        assert!(!flags.contains(ValueFlags::GOT));
    }

    #[test]
    fn test_visibility_strengthens_across_definitions() {
        // A default-visibility winner picks up the hidden visibility of a
        // losing definition and stops being exportable.
        let mut winner = ValueFlags::FUNCTION;
        assert!(winner.is_exportable());
        winner.merge(ValueFlags::VISIBILITY_HIDDEN | ValueFlags::CAN_BYPASS_GOT);
        assert!(!winner.is_exportable());
        assert_eq!(winner.st_visibility(), object::elf::STV_HIDDEN);

        let mut protected = ValueFlags::FUNCTION;
        protected.merge(ValueFlags::VISIBILITY_PROTECTED);
        assert!(protected.is_exportable());
        assert_eq!(protected.st_visibility(), object::elf::STV_PROTECTED);
    }

    #[test]
    fn test_atomic_accumulation() {
        let flags = AtomicValueFlags::new(ValueFlags::ABSOLUTE);
        let prev = flags.fetch_or(ValueFlags::GOT);
        assert_eq!(prev, ValueFlags::ABSOLUTE);
        assert!(flags.get().contains(ValueFlags::GOT | ValueFlags::ABSOLUTE));
    }
}
