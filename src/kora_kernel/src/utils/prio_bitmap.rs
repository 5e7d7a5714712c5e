//! Provides `PrioBitmap`, a one-word bit array tracking the non-empty task
//! ready lists and supporting a constant-time lowest-set-bit scan.
use core::fmt;

use super::Init;

/// A bit array with one bit per priority level. Bit *p* is set iff the ready
/// list for priority *p* is non-empty.
///
/// The kernel caps the priority level count at `u32::BITS`, so a single word
/// suffices and `find_set` is a single count-trailing-zeros instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..u32::BITS as usize).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    pub(crate) fn get(&self, i: usize) -> bool {
        assert!(i < u32::BITS as usize);
        self.bits & (1 << i) != 0
    }

    /// Clear the bit at the specified position.
    pub(crate) fn clear(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits &= !(1 << i);
    }

    /// Set the bit at the specified position.
    pub(crate) fn set(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits |= 1 << i;
    }

    /// Get the position of the first (numerically lowest) set bit.
    pub(crate) fn find_set(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros();
        if i == u32::BITS {
            None
        } else {
            Some(i as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;
    use std::vec::Vec;

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = instr[1] as usize % 32;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let j = instr[1] as usize % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(j);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    #[quickcheck]
    fn matches_btreeset_model(bytecode: Vec<u8>) {
        let mut subject = PrioBitmap::INIT;
        let mut reference = BTreeSet::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.insert(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.remove(&bit);
                }
            }

            assert_eq!(subject.find_set(), reference.iter().next().cloned());
        }

        let set_bits: Vec<usize> = (0..32).filter(|&i| subject.get(i)).collect();
        let model_bits: Vec<usize> = reference.iter().cloned().collect();
        assert_eq!(set_bits, model_bits);
    }
}
