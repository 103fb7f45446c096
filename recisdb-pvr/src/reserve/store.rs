//! Reservation store: the resolved reservation list and its mutations.
//!
//! Reads return the current list snapshot without blocking. Every mutation
//! acquires the [`ExecutionSerializer`], builds a new list, runs the
//! allocator over it, writes the file and only then swaps the snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use pvr_types::{
    EncodeOption, ManualReserveRequest, Reservation, ReserveError, ReserveFilter, ReserveKind,
    ReserveOption, ReservePage, Rule,
};

use super::allocator;
use super::file::{ReserveFile, ReserveFileError};
use super::serializer::{priority, ExecutionSerializer};
use crate::database::ProgramSource;
use crate::event::{EventBus, PvrEvent};
use crate::tuner::TunerDevice;

/// Delay between rules during a full resync.
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Delay before a failed resync is attempted again.
pub const RESYNC_RETRY: Duration = Duration::from_secs(1);

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Owner of the reservation list.
pub struct ReservationStore {
    reserves: RwLock<Arc<Vec<Reservation>>>,
    serializer: ExecutionSerializer,
    file: ReserveFile,
    tuners: Vec<TunerDevice>,
    programs: Arc<dyn ProgramSource>,
    events: Arc<EventBus>,
    next_manual_id: AtomicI64,
    pacing: Duration,
}

impl ReservationStore {
    /// Build a store from an already loaded list.
    pub fn new(
        file: ReserveFile,
        initial: Vec<Reservation>,
        tuners: Vec<TunerDevice>,
        programs: Arc<dyn ProgramSource>,
        events: Arc<EventBus>,
    ) -> Self {
        let next_manual_id = initial
            .iter()
            .filter_map(Reservation::manual_id)
            .max()
            .unwrap_or(0)
            + 1;
        let resolved = allocator::resolve(sort_by_priority(initial), &tuners);
        Self {
            reserves: RwLock::new(Arc::new(resolved)),
            serializer: ExecutionSerializer::new(),
            file,
            tuners,
            programs,
            events,
            next_manual_id: AtomicI64::new(next_manual_id),
            pacing: DEFAULT_PACING,
        }
    }

    /// Load the list from `file`. An unparsable file is returned as an error.
    pub fn load(
        file: ReserveFile,
        tuners: Vec<TunerDevice>,
        programs: Arc<dyn ProgramSource>,
        events: Arc<EventBus>,
    ) -> Result<Self, ReserveFileError> {
        let initial = file.load()?;
        Ok(Self::new(file, initial, tuners, programs, events))
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn tuners(&self) -> &[TunerDevice] {
        &self.tuners
    }

    // ---- Queries ------------------------------------------------------

    /// Current list snapshot, ordered by start time.
    pub fn reserves(&self) -> Arc<Vec<Reservation>> {
        self.reserves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reserve(&self, program_id: i64) -> Option<Reservation> {
        self.reserves()
            .iter()
            .find(|r| r.program_id() == program_id)
            .cloned()
    }

    /// Filtered page of the list. A `limit` of `None` returns everything
    /// after `offset`.
    pub fn query(&self, filter: ReserveFilter, offset: usize, limit: Option<usize>) -> ReservePage {
        let reserves = self.reserves();
        let matched: Vec<&Reservation> = reserves.iter().filter(|r| filter.matches(r)).collect();
        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        ReservePage { items, total }
    }

    // ---- Mutations ----------------------------------------------------

    /// Add a manual reservation.
    pub async fn add_reserve(
        &self,
        request: ManualReserveRequest,
    ) -> Result<Reservation, ReserveError> {
        let _guard = self.serializer.lock(priority::USER).await;
        let current = self.reserves();

        if current
            .iter()
            .any(|r| r.is_manual() && r.program_id() == request.program_id)
        {
            return Err(ReserveError::AlreadyReserved(request.program_id));
        }

        let program = self
            .programs
            .find_program(request.program_id)
            .await
            .map_err(|e| ReserveError::Source(e.to_string()))?
            .ok_or(ReserveError::ProgramNotFound(request.program_id))?;

        let manual_id = self.next_manual_id.fetch_add(1, Ordering::SeqCst);
        let mut reserve = Reservation::manual(program, manual_id);
        reserve.option = request.option;
        reserve.encode = request.encode;

        let mut next = current.as_ref().clone();
        next.push(reserve);
        let committed = self.commit(next).await?;

        let added = committed
            .iter()
            .find(|r| r.manual_id() == Some(manual_id))
            .cloned()
            .ok_or(ReserveError::ReserveNotFound(request.program_id))?;
        info!(
            "ReservationStore: added manual reservation {} ({}){}",
            added.program_id(),
            added.program.name,
            if added.is_conflict { " [conflict]" } else { "" }
        );
        self.events.emit(PvrEvent::ReserveAdded {
            reserve: added.clone(),
        });
        Ok(added)
    }

    /// Replace the option and encode settings of a manual reservation.
    ///
    /// `is_recording` is consulted while the serializer is held, after the
    /// ownership check.
    pub async fn edit_reserve<F>(
        &self,
        program_id: i64,
        option: Option<ReserveOption>,
        encode: Option<EncodeOption>,
        is_recording: F,
    ) -> Result<Reservation, ReserveError>
    where
        F: Fn(i64) -> bool,
    {
        let _guard = self.serializer.lock(priority::USER).await;
        let mut next = self.reserves().as_ref().clone();
        let reserve = next
            .iter_mut()
            .find(|r| r.program_id() == program_id)
            .ok_or(ReserveError::ReserveNotFound(program_id))?;
        if !reserve.is_manual() {
            return Err(ReserveError::RuleReservation(program_id));
        }
        if is_recording(program_id) {
            return Err(ReserveError::Recording(program_id));
        }
        reserve.option = option;
        reserve.encode = encode;

        let committed = self.commit(next).await?;
        find_in(&committed, program_id)
    }

    /// Cancel a reservation. Manual reservations are removed, rule
    /// reservations are flagged as skipped.
    pub async fn cancel(&self, program_id: i64) -> Result<(), ReserveError> {
        let _guard = self.serializer.lock(priority::USER).await;
        let mut next = self.reserves().as_ref().clone();
        let index = next
            .iter()
            .position(|r| r.program_id() == program_id)
            .ok_or(ReserveError::ReserveNotFound(program_id))?;

        if next[index].is_manual() {
            next.remove(index);
            info!("ReservationStore: removed manual reservation {}", program_id);
        } else {
            next[index].is_skip = true;
            info!("ReservationStore: skipped rule reservation {}", program_id);
        }
        self.commit(next).await?;
        Ok(())
    }

    /// Clear the skip flag of a rule reservation.
    pub async fn remove_skip(&self, program_id: i64) -> Result<Reservation, ReserveError> {
        self.modify_rule_reserve(program_id, |reserve| reserve.is_skip = false)
            .await
    }

    /// Allow a rule reservation to record although its title is in history.
    pub async fn disable_overlap(&self, program_id: i64) -> Result<Reservation, ReserveError> {
        self.modify_rule_reserve(program_id, |reserve| {
            if let ReserveKind::Rule {
                disable_overlap, ..
            } = &mut reserve.kind
            {
                *disable_overlap = true;
            }
        })
        .await
    }

    async fn modify_rule_reserve<F>(
        &self,
        program_id: i64,
        modify: F,
    ) -> Result<Reservation, ReserveError>
    where
        F: FnOnce(&mut Reservation),
    {
        let _guard = self.serializer.lock(priority::USER).await;
        let mut next = self.reserves().as_ref().clone();
        let reserve = next
            .iter_mut()
            .find(|r| r.program_id() == program_id)
            .ok_or(ReserveError::ReserveNotFound(program_id))?;
        if reserve.is_manual() {
            return Err(ReserveError::NotRuleReservation(program_id));
        }
        modify(reserve);

        let committed = self.commit(next).await?;
        find_in(&committed, program_id)
    }

    /// Remove reservations whose program has ended.
    pub async fn clean(&self) -> Result<usize, ReserveError> {
        let _guard = self.serializer.lock(priority::CLEAN).await;
        let now = now_ms();
        let current = self.reserves();
        let next: Vec<Reservation> = current
            .iter()
            .filter(|r| r.program.end_at > now)
            .cloned()
            .collect();
        let removed = current.len() - next.len();
        if removed > 0 {
            self.commit(next).await?;
            debug!("ReservationStore: cleaned {} ended reservation(s)", removed);
        }
        Ok(removed)
    }

    /// Full resync: refresh manual reservations, drop reservations of
    /// vanished rules, then re-apply every enabled rule one at a time.
    ///
    /// The serializer is released between rules so user mutations are not
    /// starved by a long resync.
    pub async fn update_all(&self) -> Result<(), ReserveError> {
        info!("ReservationStore: full resync started");
        self.refresh_manual().await?;

        let rules = self
            .programs
            .enabled_rules()
            .await
            .map_err(|e| ReserveError::Source(e.to_string()))?;
        self.drop_orphaned_rules(&rules).await?;

        for rule in &rules {
            tokio::time::sleep(self.pacing).await;
            let _guard = self.serializer.lock(priority::UPDATE_ALL).await;
            self.apply_rule(rule).await?;
        }

        self.clean().await?;
        info!(
            "ReservationStore: full resync finished ({} rule(s), {} reservation(s))",
            rules.len(),
            self.reserves().len()
        );
        Ok(())
    }

    /// Re-evaluate one rule. A deleted or disabled rule loses all its
    /// reservations.
    pub async fn update_rule(&self, rule_id: i64) -> Result<(), ReserveError> {
        let _guard = self.serializer.lock(priority::UPDATE_RULE).await;
        let rule = self
            .programs
            .find_rule(rule_id)
            .await
            .map_err(|e| ReserveError::Source(e.to_string()))?;

        match rule {
            Some(rule) if rule.enable => self.apply_rule(&rule).await,
            _ => {
                let current = self.reserves();
                let next: Vec<Reservation> = current
                    .iter()
                    .filter(|r| r.rule_id() != Some(rule_id))
                    .cloned()
                    .collect();
                if next.len() != current.len() {
                    info!(
                        "ReservationStore: rule {} gone, dropped {} reservation(s)",
                        rule_id,
                        current.len() - next.len()
                    );
                    self.commit(next).await?;
                }
                Ok(())
            }
        }
    }

    /// Re-evaluate one rule until it succeeds, waiting [`RESYNC_RETRY`]
    /// after each failure.
    pub async fn update_rule_until_done(&self, rule_id: i64) {
        let mut attempt = 1u32;
        while let Err(e) = self.update_rule(rule_id).await {
            warn!(
                "ReservationStore: rule {} resync failed (attempt {}): {}",
                rule_id, attempt, e
            );
            tokio::time::sleep(RESYNC_RETRY).await;
            attempt += 1;
        }
    }

    /// Periodic full resync. A failed pass is retried after [`RESYNC_RETRY`],
    /// a successful one waits `interval`. Never returns.
    pub async fn run_resync_loop(&self, interval: Duration) {
        loop {
            match self.update_all().await {
                Ok(()) => tokio::time::sleep(interval).await,
                Err(e) => {
                    error!("ReservationStore: full resync failed: {}", e);
                    tokio::time::sleep(RESYNC_RETRY).await;
                }
            }
        }
    }

    async fn refresh_manual(&self) -> Result<(), ReserveError> {
        let _guard = self.serializer.lock(priority::UPDATE_ALL).await;
        let current = self.reserves();
        let mut next = Vec::with_capacity(current.len());

        for reserve in current.iter() {
            if !reserve.is_manual() {
                next.push(reserve.clone());
                continue;
            }
            let program = self
                .programs
                .find_program(reserve.program_id())
                .await
                .map_err(|e| ReserveError::Source(e.to_string()))?;
            match program {
                Some(program) => {
                    let mut reserve = reserve.clone();
                    reserve.program = program;
                    next.push(reserve);
                }
                None => warn!(
                    "ReservationStore: program {} disappeared, dropping manual reservation",
                    reserve.program_id()
                ),
            }
        }

        self.commit(next).await?;
        Ok(())
    }

    async fn drop_orphaned_rules(&self, rules: &[Rule]) -> Result<(), ReserveError> {
        let _guard = self.serializer.lock(priority::UPDATE_ALL).await;
        let enabled: HashSet<i64> = rules.iter().map(|r| r.id).collect();
        let current = self.reserves();
        let next: Vec<Reservation> = current
            .iter()
            .filter(|r| r.rule_id().map_or(true, |id| enabled.contains(&id)))
            .cloned()
            .collect();
        if next.len() != current.len() {
            self.commit(next).await?;
        }
        Ok(())
    }

    /// Replace the reservations of `rule` with its current matches.
    /// Must be called with the serializer held.
    async fn apply_rule(&self, rule: &Rule) -> Result<(), ReserveError> {
        let matches = self
            .programs
            .find_by_rule(rule, now_ms())
            .await
            .map_err(|e| ReserveError::Source(e.to_string()))?;

        let current = self.reserves();
        let previous: HashMap<i64, &Reservation> = current
            .iter()
            .filter(|r| r.rule_id() == Some(rule.id))
            .map(|r| (r.program_id(), r))
            .collect();

        let mut next: Vec<Reservation> = current
            .iter()
            .filter(|r| r.rule_id() != Some(rule.id))
            .cloned()
            .collect();
        let mut added = HashSet::new();

        for m in matches {
            let program_id = m.program.id;
            let mut reserve = Reservation::from_rule(m.program, rule.id, m.is_duplicate_of_history);
            reserve.option = rule.option.clone();
            reserve.encode = rule.encode.clone();

            match previous.get(&program_id) {
                Some(old) => {
                    reserve.is_skip = old.is_skip;
                    if let (
                        ReserveKind::Rule {
                            disable_overlap, ..
                        },
                        ReserveKind::Rule {
                            disable_overlap: kept,
                            ..
                        },
                    ) = (&mut reserve.kind, old.kind)
                    {
                        *disable_overlap = kept;
                    }
                }
                None => {
                    added.insert(program_id);
                }
            }
            next.push(reserve);
        }

        let committed = self.commit(next).await?;
        debug!(
            "ReservationStore: rule {} applied ({} new)",
            rule.id,
            added.len()
        );

        for reserve in committed
            .iter()
            .filter(|r| r.rule_id() == Some(rule.id) && added.contains(&r.program_id()))
        {
            self.events.emit(PvrEvent::ReserveAdded {
                reserve: reserve.clone(),
            });
        }
        Ok(())
    }

    /// Resolve conflicts, persist and publish a new list.
    async fn commit(&self, next: Vec<Reservation>) -> Result<Arc<Vec<Reservation>>, ReserveError> {
        let resolved = allocator::resolve(sort_by_priority(next), &self.tuners);
        self.file
            .save(&resolved)
            .await
            .map_err(|e| ReserveError::Persist(e.to_string()))?;

        let resolved = Arc::new(resolved);
        *self.reserves.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&resolved);
        Ok(resolved)
    }
}

/// Stable sort into allocator precedence order.
fn sort_by_priority(mut reserves: Vec<Reservation>) -> Vec<Reservation> {
    reserves.sort_by_key(Reservation::priority_key);
    reserves
}

fn find_in(reserves: &[Reservation], program_id: i64) -> Result<Reservation, ReserveError> {
    reserves
        .iter()
        .find(|r| r.program_id() == program_id)
        .cloned()
        .ok_or(ReserveError::ReserveNotFound(program_id))
}
