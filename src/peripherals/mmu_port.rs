// Wires `memory::mmu::Mmu` into I/O ports 20/21/22 (§4.2).
//
// Grounded on iosim.c's `mmui_out`/`mmus_out`/`mmuc_out` (writes) and
// `mmui_in`/`mmus_in`/`mmuc_in` (reads).

use crate::memory::mmu::{Mmu, MmuError};
use crate::memory::Bus;

/// `OUT 22, v`: configure segment size. Fatal if banks already exist.
pub fn segsize_out(mmu: &mut Mmu, v: u8) -> Result<(), MmuError> {
    mmu.configure_segsize(v)
}
/// `IN 22`: segment size in pages.
pub fn segsize_in(mmu: &Mmu) -> u8 {
    mmu.segsize_pages()
}

/// `OUT 20, v`: allocate `v` banks. Fatal if `v` exceeds `MAX_BANKS`.
pub fn init_out(mmu: &mut Mmu, v: u8) -> Result<(), MmuError> {
    mmu.allocate_banks(v)
}
/// `IN 20`: number of allocated banks.
pub fn init_in(mmu: &Mmu) -> u8 {
    mmu.bank_count()
}

/// `OUT 21, v`: select a bank. Fatal if out of range.
pub fn select_out(mmu: &mut Mmu, v: u8, ram: &mut dyn Bus) -> Result<(), MmuError> {
    mmu.select_bank(v, ram)
}
/// `IN 21`: currently selected bank.
pub fn select_in(mmu: &Mmu) -> u8 {
    mmu.selected_bank()
}
