use smallvec::SmallVec;

use crate::le::Addr;

use super::*;

/// Peer that one or more applications want to be connected to automatically.
#[derive(Clone, Debug)]
struct BgConn {
    peer: Addr,
    apps: SmallVec<[AppId; 4]>,
}

/// Background connection directory.
#[derive(Debug)]
pub(super) struct BgConns {
    v: Vec<BgConn>,
    cap: usize,
}

impl BgConns {
    /// Creates a directory that holds at most `cap` peers.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            v: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Adds `app` to the set of applications interested in `peer`. Returns
    /// `true` if this is the first application for the peer.
    pub fn add(&mut self, peer: Addr, app: AppId) -> Result<bool> {
        if let Some(c) = self.v.iter_mut().find(|c| c.peer == peer) {
            if !c.apps.contains(&app) {
                c.apps.push(app);
            }
            return Ok(false);
        }
        if self.v.len() >= self.cap {
            return Err(Error::NoResources);
        }
        let mut apps = SmallVec::new();
        apps.push(app);
        self.v.push(BgConn { peer, apps });
        Ok(true)
    }

    /// Removes `app` from the set for `peer`. Returns `Ok(true)` if the peer
    /// entry was removed because no applications remain.
    pub fn remove(&mut self, peer: Addr, app: AppId) -> Result<bool> {
        let i = (self.v.iter().position(|c| c.peer == peer)).ok_or(Error::NotFound)?;
        let c = &mut self.v[i];
        let j = (c.apps.iter().position(|&a| a == app)).ok_or(Error::NotFound)?;
        c.apps.swap_remove(j);
        if c.apps.is_empty() {
            self.v.swap_remove(i);
            return Ok(true);
        }
        Ok(false)
    }

    /// Removes `app` from every entry and returns the peers that no longer
    /// have any interested applications.
    pub fn remove_app(&mut self, app: AppId) -> Vec<Addr> {
        let mut gone = Vec::new();
        self.v.retain_mut(|c| {
            c.apps.retain(|a| *a != app);
            if c.apps.is_empty() {
                gone.push(c.peer);
                return false;
            }
            true
        });
        gone
    }

    /// Returns the applications interested in `peer`.
    #[must_use]
    pub fn apps(&self, peer: Addr) -> &[AppId] {
        (self.v.iter().find(|c| c.peer == peer)).map_or(&[], |c| c.apps.as_slice())
    }

    /// Returns whether any application wants an automatic connection to
    /// `peer`.
    #[inline]
    #[must_use]
    pub fn contains(&self, peer: Addr) -> bool {
        self.v.iter().any(|c| c.peer == peer)
    }
}
