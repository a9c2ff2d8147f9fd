//! The transactional boundary.
//!
//! A unit of work is one PostgreSQL transaction. It commits on `commit()` and
//! rolls back when dropped without a commit, so an early `?` can never leave
//! half a task transition behind. Repositories borrow the transaction and
//! are the only write path into storage.

use super::campaigns::CampaignRepo;
use super::places::PlaceRepo;
use super::tasks::TaskRepo;
use crate::error::Result;
use sqlx::{Postgres, Transaction};

pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork {
    pub(super) fn new(tx: Transaction<'static, Postgres>) -> Self {
        UnitOfWork { tx }
    }

    pub fn campaigns(&mut self) -> CampaignRepo<'_> {
        CampaignRepo::new(&mut self.tx)
    }

    pub fn tasks(&mut self) -> TaskRepo<'_> {
        TaskRepo::new(&mut self.tx)
    }

    pub fn places(&mut self) -> PlaceRepo<'_> {
        PlaceRepo::new(&mut self.tx)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
