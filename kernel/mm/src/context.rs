//! Recovery state shared by the boot phases.
//!
//! Everything the reservation and reconstruction passes need to remember
//! between each other lives in one [`PramContext`], owned by whoever drives
//! boot. The lifecycle is:
//!
//! 1. [`PramContext::new`] from the parsed command line.
//! 2. Memory setup bans ranges through [`PramContext::banned_mut`].
//! 3. [`PramContext::reserve`] runs once, before general allocation starts.
//! 4. Reconstruction takes the claims with
//!    [`PramContext::take_reservation`] and accounts for every page it
//!    passes on with [`PramContext::hand_over`] or
//!    [`PramContext::release_pages`].

use pram_core::banned::BannedRegions;
use pram_core::cmdline::PramParams;
use pram_core::{Pfn, kdebug, kerr, kinfo};

use crate::reserve::{ReservedChain, Reserver};
use crate::{PageReserver, ReserveError};

/// Persistent-memory recovery state.
#[derive(Debug, Default)]
pub struct PramContext {
    /// First root block, or `None` once the store is absent or abandoned.
    root: Option<Pfn>,
    /// Pages currently claimed on behalf of the store and not yet handed
    /// over or released.
    reserved_pages: u64,
    banned: BannedRegions,
    /// Claims made by a successful reservation, until reconstruction
    /// takes them.
    pending: Option<ReservedChain>,
    /// Set once a reservation pass has succeeded. Stays set after the claims
    /// are taken or abandoned.
    reserved: bool,
}

impl PramContext {
    /// Creates the context for the store named on the command line.
    #[must_use]
    pub fn new(params: &PramParams) -> Self {
        Self {
            root: params.root,
            ..Self::default()
        }
    }

    /// Creates a context for a store rooted at `root`.
    #[must_use]
    pub fn with_root(root: Pfn) -> Self {
        Self {
            root: root.non_null(),
            ..Self::default()
        }
    }

    /// First root block of the store, if one is still in play.
    #[must_use]
    pub fn root(&self) -> Option<Pfn> {
        self.root
    }

    /// Forgets the store. Later phases treat it as absent.
    pub fn clear_root(&mut self) {
        self.root = None;
    }

    /// Pages still accounted to the store.
    #[must_use]
    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    /// Ranges excluded from the store.
    #[must_use]
    pub fn banned(&self) -> &BannedRegions {
        &self.banned
    }

    /// Ranges excluded from the store, for memory setup to extend.
    pub fn banned_mut(&mut self) -> &mut BannedRegions {
        &mut self.banned
    }

    /// Returns `true` if a reservation is waiting to be reconstructed.
    #[must_use]
    pub fn has_reservation(&self) -> bool {
        self.pending.is_some()
    }

    /// Claims every page of the store from `alloc`, all or nothing.
    ///
    /// Bans are ignored while the pass runs. Returns the number of pages
    /// claimed, 0 when no store is configured. After a successful pass,
    /// later calls return the pages still accounted to the store without
    /// touching `alloc`, even once the claims have been taken.
    ///
    /// # Errors
    ///
    /// The first failure found in the store. The store is then abandoned and
    /// nothing stays claimed.
    pub fn reserve<A: PageReserver + ?Sized>(&mut self, alloc: &mut A) -> Result<u64, ReserveError> {
        if self.reserved {
            return Ok(self.reserved_pages);
        }
        let Some(first) = self.root else {
            kdebug!("PRAM: no persistent memory configured");
            return Ok(0);
        };

        kinfo!("PRAM: Examining persistent memory from pfn:{first:x}");
        self.banned.freeze();
        let result = Reserver::new(alloc, &mut self.reserved_pages).reserve_root_chain(first);
        self.banned.thaw();

        match result {
            Ok(chain) => {
                let pages = chain.pages();
                debug_assert_eq!(pages, self.reserved_pages);
                kinfo!("PRAM: {pages} pages reserved");
                self.pending = Some(chain);
                self.reserved = true;
                Ok(pages)
            }
            Err(err) => {
                kerr!("PRAM: Reservation failed: {err}");
                debug_assert_eq!(self.reserved_pages, 0, "failed reservation left pages claimed");
                self.root = None;
                Err(err)
            }
        }
    }

    /// Hands the reservation over to reconstruction.
    ///
    /// The pages stay counted until they are handed over or released.
    pub fn take_reservation(&mut self) -> Option<ReservedChain> {
        self.pending.take()
    }

    /// Releases a reservation that will never be reconstructed and forgets
    /// the store.
    pub fn abandon<A: PageReserver + ?Sized>(&mut self, alloc: &mut A) {
        if let Some(chain) = self.pending.take() {
            kinfo!("PRAM: releasing {} reserved pages", chain.pages());
            Reserver::new(alloc, &mut self.reserved_pages).release_chain(chain);
        }
        self.root = None;
    }

    /// Records that `pages` reserved pages now belong to someone else.
    pub fn hand_over(&mut self, pages: u64) {
        debug_assert!(self.reserved_pages >= pages, "reservation counter underflow");
        self.reserved_pages = self.reserved_pages.saturating_sub(pages);
    }

    /// Returns `count` reserved frames at `pfn` to `alloc`.
    pub fn release_pages<A: PageReserver + ?Sized>(&mut self, alloc: &mut A, pfn: Pfn, count: u64) {
        alloc.release_range(pfn, count);
        self.hand_over(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Memblock;
    use pram_core::image::{ImageWriter, RamImage};
    use pram_core::layout::S_IFREG;

    fn store() -> (RamImage, Pfn) {
        let mut writer = ImageWriter::new(32);
        writer.add_file("a", S_IFREG | 0o644, &[7; 4096 * 2]).unwrap();
        writer.add_file("b", S_IFREG | 0o600, b"hi").unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn absent_store_reserves_nothing() {
        let mut ctx = PramContext::new(&PramParams::parse(Some("quiet")));
        let mut mb = Memblock::new(RamImage::zeroed(8), ctx.banned());
        assert_eq!(ctx.reserve(&mut mb), Ok(0));
        assert!(!ctx.has_reservation());
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn successful_reservation_is_pending() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        // a: head + node + 2 data; b: head + node + 1 data; root.
        assert_eq!(ctx.reserve(&mut mb), Ok(8));
        assert_eq!(ctx.reserved_pages(), 8);
        assert!(!ctx.banned().is_frozen());
        assert_eq!(ctx.reserve(&mut mb), Ok(8));
        assert_eq!(mb.owned_frames(), 9);

        let chain = ctx.take_reservation().unwrap();
        assert_eq!(chain.first(), root);
        assert_eq!(ctx.reserved_pages(), 8);
    }

    #[test]
    fn reserve_after_take_does_not_walk_again() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        assert_eq!(ctx.reserve(&mut mb), Ok(8));
        let chain = ctx.take_reservation().unwrap();

        assert_eq!(ctx.reserve(&mut mb), Ok(8));
        assert_eq!(ctx.root(), Some(root));
        assert!(!ctx.has_reservation());
        assert_eq!(mb.owned_frames(), 9);

        ctx.release_pages(&mut mb, chain.roots()[0].pfn(), 1);
        assert_eq!(ctx.reserve(&mut mb), Ok(7));
    }

    #[test]
    fn reserve_after_abandon_claims_nothing() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        ctx.reserve(&mut mb).unwrap();
        ctx.abandon(&mut mb);
        assert_eq!(ctx.reserve(&mut mb), Ok(0));
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn failure_clears_root() {
        let (mut image, root) = store();
        image.page_mut(root).unwrap()[20] ^= 1;
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        assert!(matches!(ctx.reserve(&mut mb), Err(ReserveError::Corrupt(_))));
        assert_eq!(ctx.root(), None);
        assert_eq!(ctx.reserved_pages(), 0);
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn banned_store_page_conflicts() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        ctx.banned_mut().ban(Pfn::new(2), Pfn::new(2)).unwrap();
        let mut mb = Memblock::new(image, ctx.banned());
        assert_eq!(
            ctx.reserve(&mut mb),
            Err(ReserveError::Conflict {
                pfn: Pfn::new(1),
                order: 1
            })
        );
        assert_eq!(ctx.reserved_pages(), 0);
        assert_eq!(mb.owned_frames(), 2);
    }

    #[test]
    fn abandon_releases_everything() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        ctx.reserve(&mut mb).unwrap();
        ctx.abandon(&mut mb);
        assert_eq!(ctx.reserved_pages(), 0);
        assert_eq!(ctx.root(), None);
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn hand_over_and_release_account_pages() {
        let (image, root) = store();
        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        ctx.reserve(&mut mb).unwrap();
        let chain = ctx.take_reservation().unwrap();

        ctx.hand_over(3);
        ctx.release_pages(&mut mb, chain.roots()[0].pfn(), 1);
        assert_eq!(ctx.reserved_pages(), 4);
        assert!(!mb.is_reserved(chain.roots()[0].pfn()));
    }
}
