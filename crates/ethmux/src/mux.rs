//! The device multiplexer: session arena, filter aggregation, event fan-out.
//!
//! One mutex guards the active/idle membership sets and every aggregate
//! filter counter. Calls into the device's start/stop entry points release
//! that lock for the duration of the call — the device may call back into
//! receive/status delivery, which re-acquires it — and session liveness is
//! re-checked after the lock is retaken.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use ethmux_core::{
    DescFlags, DeviceInfo, EventSink, FrameDesc, LinkStatus, MacAddr, NetDevice, Param,
    SessionId, TxStatus, TxTag, MAX_MULTICAST_FILTERS,
};
use ethmux_shm::{BufferHandle, FifoError};

use crate::buffer::MappedBuffer;
use crate::filter::McastFilter;
use crate::session::{drain_loop, SessionFifos, SessionFlags, SessionShared, SessionState};
use crate::Error;

/// Snapshot of one session's observable state.
#[derive(Debug, Clone)]
pub struct SessionDiagnostics {
    pub id: u32,
    pub name: String,
    pub state: SessionState,
    pub flags: SessionFlags,
    pub multicast_addresses: usize,
    pub in_flight: usize,
    pub tx_frames: u64,
    pub tx_invalid: u64,
    pub rx_frames: u64,
    pub rx_drops: u64,
    /// Transmit descriptors posted by the client, not yet drained.
    pub tx_pending: usize,
    /// Receive buffers posted by the client, not yet consumed.
    pub rx_posted: usize,
}

/// Snapshot of the multiplexer's observable state.
#[derive(Debug, Clone)]
pub struct MuxDiagnostics {
    pub link: LinkStatus,
    pub started: bool,
    pub promiscuous_requests: usize,
    pub multicast_promiscuous_requests: usize,
    pub sessions: Vec<SessionDiagnostics>,
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    state: SessionState,
    flags: SessionFlags,
    mcast: McastFilter,
    /// Open `Session` handles referring to this entry.
    handles: usize,
    /// Transmits queued to the device whose completion has not fired yet.
    /// The entry (and its pool) stays in the arena until this drains.
    in_flight: usize,
    thread: Option<thread::JoinHandle<()>>,
    thread_running: bool,
}

struct MuxState {
    sessions: HashMap<SessionId, SessionEntry>,
    active: BTreeSet<SessionId>,
    idle: BTreeSet<SessionId>,
    promisc_count: usize,
    mcast_promisc_count: usize,
    /// Device started (first session active) and not yet stopped.
    started: bool,
    link: LinkStatus,
    /// Set at teardown; every subsequent session operation fails BadState.
    dead: bool,
}

/// The per-device multiplexer.
pub struct Mux {
    device: Arc<dyn NetDevice>,
    info: DeviceInfo,
    state: Mutex<MuxState>,
    /// Signaled when a drain thread exits (stop waits on this).
    thread_exited: Condvar,
    next_id: AtomicU32,
}

impl Mux {
    /// Bind the multiplexer to a device.
    pub fn new(device: Arc<dyn NetDevice>) -> Arc<Self> {
        let info = device.query();
        Arc::new(Self {
            device,
            info,
            state: Mutex::new(MuxState {
                sessions: HashMap::new(),
                active: BTreeSet::new(),
                idle: BTreeSet::new(),
                promisc_count: 0,
                mcast_promisc_count: 0,
                started: false,
                link: LinkStatus::empty(),
                dead: false,
            }),
            thread_exited: Condvar::new(),
            next_id: AtomicU32::new(0),
        })
    }

    /// Device capabilities, as cached at bind time.
    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub(crate) fn device(&self) -> Arc<dyn NetDevice> {
        Arc::clone(&self.device)
    }

    /// Open a new session in the idle set.
    pub fn open_session(self: &Arc<Self>, name: &str) -> Result<Session, Error> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = SessionShared::new(id, name)?;
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        st.sessions.insert(
            id,
            SessionEntry {
                shared: Arc::clone(&shared),
                state: SessionState::Idle,
                flags: SessionFlags::empty(),
                mcast: McastFilter::default(),
                handles: 1,
                in_flight: 0,
                thread: None,
                thread_running: false,
            },
        );
        st.idle.insert(id);
        drop(st);
        tracing::debug!(session = id.0, name, "session opened");
        Ok(Session {
            mux: Arc::clone(self),
            shared,
        })
    }

    /// Tear the multiplexer down (device removal). Every active session is
    /// stopped with its filters unwound, every idle session has its
    /// resources released. Sessions with open handles or in-flight
    /// transmits linger as `Dead` until those drain; this never blocks on
    /// them.
    pub fn teardown(&self) {
        let mut st = self.state.lock();
        if st.dead {
            return;
        }
        st.dead = true;
        let active: Vec<SessionId> = st.active.iter().copied().collect();
        for id in active {
            self.deactivate_locked(&mut st, id);
        }
        if st.started {
            st.started = false;
            drop(st);
            self.device.stop();
            st = self.state.lock();
        }

        let ids: Vec<SessionId> = st.sessions.keys().copied().collect();
        let mut joins = Vec::new();
        for id in ids {
            while st
                .sessions
                .get(&id)
                .map(|e| e.thread_running)
                .unwrap_or(false)
            {
                self.thread_exited.wait(&mut st);
            }
            self.release_filters_locked(&mut st, id);
            if let Some(entry) = st.sessions.get_mut(&id) {
                entry.state = SessionState::Dead;
                entry.shared.tx_fifo.close();
                entry.shared.rx_fifo.close();
                entry.shared.buffer.lock().take();
                entry.shared.client_fifos.lock().take();
                if let Some(handle) = entry.thread.take() {
                    joins.push(handle);
                }
            }
            st.idle.remove(&id);
            st.active.remove(&id);
            let drained = st
                .sessions
                .get(&id)
                .map(|e| e.handles == 0 && e.in_flight == 0)
                .unwrap_or(false);
            if drained {
                st.sessions.remove(&id);
            }
        }
        drop(st);
        for handle in joins {
            let _ = handle.join();
        }
        tracing::debug!("multiplexer torn down");
    }

    /// Full diagnostics dump.
    pub fn diagnostics(&self) -> MuxDiagnostics {
        let st = self.state.lock();
        let sessions = st
            .sessions
            .values()
            .map(|entry| {
                let shared = &entry.shared;
                let (tx_pending, rx_posted) = shared.fifo_depths();
                SessionDiagnostics {
                    id: shared.id.0,
                    name: shared.name.lock().clone(),
                    state: entry.state,
                    flags: entry.flags,
                    multicast_addresses: entry.mcast.len(),
                    in_flight: entry.in_flight,
                    tx_frames: shared.counters.tx_frames.load(Ordering::Relaxed),
                    tx_invalid: shared.counters.tx_invalid.load(Ordering::Relaxed),
                    rx_frames: shared.counters.rx_frames.load(Ordering::Relaxed),
                    rx_drops: shared.counters.rx_drops.load(Ordering::Relaxed),
                    tx_pending,
                    rx_posted,
                }
            })
            .collect();
        MuxDiagnostics {
            link: st.link,
            started: st.started,
            promiscuous_requests: st.promisc_count,
            multicast_promiscuous_requests: st.mcast_promisc_count,
            sessions,
        }
    }

    // ------------------------------------------------------------------
    // Session operations (called through the Session handle)
    // ------------------------------------------------------------------

    fn ensure_alive(&self, id: SessionId) -> Result<(), Error> {
        let st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        match st.sessions.get(&id) {
            Some(entry) if entry.state != SessionState::Dead => Ok(()),
            _ => Err(Error::BadState),
        }
    }

    fn bind_buffer(&self, shared: &Arc<SessionShared>, handle: BufferHandle) -> Result<(), Error> {
        self.ensure_alive(shared.id)?;
        let mut slot = shared.buffer.lock();
        if slot.is_some() {
            return Err(Error::AlreadyBound);
        }
        // Mapping (and DMA pinning, when the device requires physical
        // addresses) happens before the region counts as bound; a failure
        // leaves the session unbound.
        let buffer = MappedBuffer::bind(handle, &self.info, self.device.as_ref())?;
        *slot = Some(Arc::new(buffer));
        Ok(())
    }

    fn start_session(self: &Arc<Self>, id: SessionId) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        {
            let entry = st.sessions.get_mut(&id).ok_or(Error::BadState)?;
            match entry.state {
                SessionState::Dead => return Err(Error::BadState),
                // Starting twice is idempotent.
                SessionState::Running => return Ok(()),
                SessionState::Idle => {}
            }
            if entry.shared.buffer.lock().is_none() {
                return Err(Error::BadState);
            }
            if !entry.thread_running {
                // A previous stop joined the old thread; reap its handle
                // and clear any stale shutdown signal before respawning.
                if let Some(old) = entry.thread.take() {
                    let _ = old.join();
                }
                entry.shared.drain_stale_shutdown();
                let mux = Arc::clone(self);
                let shared = Arc::clone(&entry.shared);
                let handle = thread::Builder::new()
                    .name(format!("ethmux-tx-{}", id.0))
                    .spawn(move || drain_loop(mux, shared))?;
                entry.thread = Some(handle);
                entry.thread_running = true;
            }
        }

        if st.active.is_empty() && !st.started {
            // First session going active: start the device with the lock
            // released, since its callbacks re-enter delivery paths.
            st.started = true;
            drop(st);
            let sink: Arc<dyn EventSink> = Arc::clone(self) as Arc<dyn EventSink>;
            let result = self.device.start(sink);
            st = self.state.lock();
            if let Err(err) = result {
                st.started = false;
                return Err(err.into());
            }
            let alive = st
                .sessions
                .get(&id)
                .map(|e| e.state == SessionState::Idle)
                .unwrap_or(false);
            if !alive {
                // Torn down while the lock was released.
                if st.active.is_empty() && st.started {
                    st.started = false;
                    drop(st);
                    self.device.stop();
                }
                return Err(Error::BadState);
            }
        }

        st.idle.remove(&id);
        st.active.insert(id);
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.state = SessionState::Running;
        }
        // The session's multicast addresses now count toward the union.
        self.push_multicast_locked(&mut st);
        if let Some(entry) = st.sessions.get(&id) {
            // Wake the client so it polls the initial link status instead
            // of waiting for the next change.
            entry.shared.rx_fifo.signal_status();
        }
        drop(st);
        tracing::debug!(session = id.0, "session started");
        Ok(())
    }

    fn stop_session(&self, id: SessionId) -> Result<(), Error> {
        let mut st = self.state.lock();
        let running = st
            .sessions
            .get(&id)
            .map(|e| e.state == SessionState::Running)
            .unwrap_or(false);
        if !running {
            // Stop is always safe to call repeatedly.
            return Ok(());
        }
        self.deactivate_locked(&mut st, id);
        if st.active.is_empty() && st.started {
            st.started = false;
            drop(st);
            self.device.stop();
            st = self.state.lock();
        }
        self.join_drain_thread(st, id);
        tracing::debug!(session = id.0, "session stopped");
        Ok(())
    }

    /// Wait for the session's drain thread to exit and join it. Consumes
    /// the guard; the join itself happens unlocked.
    fn join_drain_thread(
        &self,
        mut st: parking_lot::MutexGuard<'_, MuxState>,
        id: SessionId,
    ) {
        while st
            .sessions
            .get(&id)
            .map(|e| e.thread_running)
            .unwrap_or(false)
        {
            self.thread_exited.wait(&mut st);
        }
        let handle = st.sessions.get_mut(&id).and_then(|e| e.thread.take());
        drop(st);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Move a running session out of the active set and unwind its filter
    /// contributions. The drain thread is signaled but not joined here.
    fn deactivate_locked(&self, st: &mut MuxState, id: SessionId) {
        if !st.active.remove(&id) {
            return;
        }
        st.idle.insert(id);
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.state = SessionState::Idle;
            entry.shared.shutdown_signal.signal();
        }
        self.release_filters_locked(st, id);
        self.push_multicast_locked(st);
    }

    /// Drop the session's promiscuous/multicast-promiscuous contributions.
    /// Unwind is best-effort: a failing hardware call is logged, not
    /// propagated.
    fn release_filters_locked(&self, st: &mut MuxState, id: SessionId) {
        let (had_promisc, had_mcast_promisc) = match st.sessions.get_mut(&id) {
            Some(entry) => {
                let had = (
                    entry.flags.contains(SessionFlags::PROMISCUOUS),
                    entry.flags.contains(SessionFlags::MCAST_PROMISCUOUS),
                );
                entry
                    .flags
                    .remove(SessionFlags::PROMISCUOUS | SessionFlags::MCAST_PROMISCUOUS);
                had
            }
            None => return,
        };
        if had_promisc {
            st.promisc_count -= 1;
            if st.promisc_count == 0 {
                if let Err(err) = self.device.set_parameter(Param::Promiscuous(false)) {
                    tracing::warn!(?err, "failed to clear promiscuous mode");
                }
            }
        }
        if had_mcast_promisc {
            st.mcast_promisc_count -= 1;
            if st.mcast_promisc_count == 0 {
                if let Err(err) = self
                    .device
                    .set_parameter(Param::MulticastPromiscuous(false))
                {
                    tracing::warn!(?err, "failed to clear multicast-promiscuous mode");
                }
            }
        }
    }

    /// Recompute the deduplicated multicast union over every active session
    /// and push it (or the overflow parameter) to the device. There is no
    /// incremental update: removal always rebuilds.
    fn push_multicast_locked(&self, st: &mut MuxState) {
        let mut union: BTreeSet<MacAddr> = BTreeSet::new();
        let mut overflow = false;
        for id in &st.active {
            if let Some(entry) = st.sessions.get(id) {
                overflow |= entry.mcast.overflowed();
                union.extend(entry.mcast.addrs().iter().copied());
            }
        }
        if union.len() > MAX_MULTICAST_FILTERS {
            overflow = true;
        }
        let param = if overflow {
            Param::MulticastFilterOverflow
        } else {
            Param::MulticastFilter(union.into_iter().collect())
        };
        if let Err(err) = self.device.set_parameter(param) {
            tracing::warn!(?err, "multicast filter push failed");
        }
    }

    fn set_promiscuous(&self, id: SessionId, enable: bool) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        let has = match st.sessions.get(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                entry.flags.contains(SessionFlags::PROMISCUOUS)
            }
            _ => return Err(Error::BadState),
        };
        if has == enable {
            return Ok(());
        }
        // The hardware call happens only on the 0<->1 transitions and is
        // committed before any state mutates, keeping the request fully
        // transactional.
        if enable {
            if st.promisc_count == 0 {
                self.device.set_parameter(Param::Promiscuous(true))?;
            }
            st.promisc_count += 1;
        } else {
            if st.promisc_count == 1 {
                self.device.set_parameter(Param::Promiscuous(false))?;
            }
            st.promisc_count -= 1;
        }
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.flags.set(SessionFlags::PROMISCUOUS, enable);
        }
        Ok(())
    }

    fn set_multicast_promiscuous(&self, id: SessionId, enable: bool) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        let has = match st.sessions.get(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                entry.flags.contains(SessionFlags::MCAST_PROMISCUOUS)
            }
            _ => return Err(Error::BadState),
        };
        if has == enable {
            return Ok(());
        }
        if enable {
            if st.mcast_promisc_count == 0 {
                self.device
                    .set_parameter(Param::MulticastPromiscuous(true))?;
            }
            st.mcast_promisc_count += 1;
        } else {
            if st.mcast_promisc_count == 1 {
                self.device
                    .set_parameter(Param::MulticastPromiscuous(false))?;
            }
            st.mcast_promisc_count -= 1;
        }
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.flags.set(SessionFlags::MCAST_PROMISCUOUS, enable);
        }
        Ok(())
    }

    fn add_multicast(&self, id: SessionId, addr: MacAddr) -> Result<(), Error> {
        if !addr.is_multicast() {
            return Err(Error::InvalidArgs("multicast address required"));
        }
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        let active = match st.sessions.get_mut(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                entry.mcast.add(addr);
                entry.state == SessionState::Running
            }
            _ => return Err(Error::BadState),
        };
        if active {
            self.push_multicast_locked(&mut st);
        }
        Ok(())
    }

    fn remove_multicast(&self, id: SessionId, addr: MacAddr) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        let active = match st.sessions.get_mut(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                entry.mcast.remove(&addr);
                entry.state == SessionState::Running
            }
            _ => return Err(Error::BadState),
        };
        if active {
            self.push_multicast_locked(&mut st);
        }
        Ok(())
    }

    fn set_listen(&self, id: SessionId, listen: bool, loopback: bool) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        match st.sessions.get_mut(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                entry.flags.set(SessionFlags::TX_LISTEN, listen);
                entry.flags.set(SessionFlags::TX_LOOPBACK, listen && loopback);
                Ok(())
            }
            _ => Err(Error::BadState),
        }
    }

    fn status(&self, id: SessionId) -> Result<LinkStatus, Error> {
        let st = self.state.lock();
        if st.dead {
            return Err(Error::BadState);
        }
        match st.sessions.get(&id) {
            Some(entry) if entry.state != SessionState::Dead => {
                // Reading status is what clears the edge-triggered signal.
                entry.shared.rx_fifo.clear_status_signal();
                Ok(st.link)
            }
            _ => Err(Error::BadState),
        }
    }

    fn session_diagnostics(&self, id: SessionId) -> Result<SessionDiagnostics, Error> {
        self.diagnostics()
            .sessions
            .into_iter()
            .find(|s| s.id == id.0)
            .ok_or(Error::BadState)
    }

    // ------------------------------------------------------------------
    // Handle lifetime
    // ------------------------------------------------------------------

    fn add_handle(&self, id: SessionId) {
        let mut st = self.state.lock();
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.handles += 1;
        }
    }

    fn close_handle(&self, id: SessionId) {
        let mut st = self.state.lock();
        let Some(entry) = st.sessions.get_mut(&id) else {
            return;
        };
        entry.handles -= 1;
        if entry.handles > 0 {
            return;
        }
        let was_running = entry.state == SessionState::Running;
        if was_running {
            self.deactivate_locked(&mut st, id);
            if st.active.is_empty() && st.started {
                st.started = false;
                drop(st);
                self.device.stop();
                st = self.state.lock();
            }
        }
        // Wait out the drain thread before releasing its fifos.
        while st
            .sessions
            .get(&id)
            .map(|e| e.thread_running)
            .unwrap_or(false)
        {
            self.thread_exited.wait(&mut st);
        }
        self.release_filters_locked(&mut st, id);
        st.idle.remove(&id);
        let mut join = None;
        let mut drained = false;
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.state = SessionState::Dead;
            entry.shared.tx_fifo.close();
            entry.shared.rx_fifo.close();
            entry.shared.buffer.lock().take();
            entry.shared.client_fifos.lock().take();
            join = entry.thread.take();
            drained = entry.in_flight == 0;
        }
        if drained {
            // No in-flight completions can reference the session anymore.
            st.sessions.remove(&id);
        }
        drop(st);
        if let Some(handle) = join {
            let _ = handle.join();
        }
        tracing::debug!(session = id.0, "session released");
    }

    // ------------------------------------------------------------------
    // Data-path hooks (called by the drain thread)
    // ------------------------------------------------------------------

    /// Account a batch of imminent submissions. Returns the session's
    /// loopback flag, or `None` if the session is no longer running.
    pub(crate) fn begin_tx(&self, id: SessionId, count: usize) -> Option<bool> {
        let mut st = self.state.lock();
        let entry = st.sessions.get_mut(&id)?;
        if entry.state != SessionState::Running {
            return None;
        }
        entry.in_flight += count;
        Some(entry.flags.contains(SessionFlags::TX_LOOPBACK))
    }

    /// Fan a transmitted frame out to every active session listening for
    /// transmits, marked as an echo.
    pub(crate) fn fanout_echo(&self, frame: &[u8]) {
        let mut st = self.state.lock();
        let targets: Vec<SessionId> = st
            .active
            .iter()
            .filter(|id| {
                st.sessions
                    .get(id)
                    .map(|e| e.flags.contains(SessionFlags::TX_LISTEN))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        let mut fatal = Vec::new();
        for id in targets {
            if let Some(entry) = st.sessions.get(&id) {
                let shared = Arc::clone(&entry.shared);
                if shared.recv_locked(frame, DescFlags::ECHO).is_err() {
                    fatal.push(id);
                }
            }
        }
        self.kill_sessions_locked(st, fatal);
    }

    /// Internal stop for a session whose data path hit a fatal error.
    /// Called from the drain thread itself, so the thread is not joined.
    pub(crate) fn fatal_session(&self, id: SessionId) {
        let mut st = self.state.lock();
        let running = st
            .sessions
            .get(&id)
            .map(|e| e.state == SessionState::Running)
            .unwrap_or(false);
        if !running {
            return;
        }
        tracing::warn!(session = id.0, "session failed, stopping internally");
        self.deactivate_locked(&mut st, id);
        if st.active.is_empty() && st.started {
            st.started = false;
            drop(st);
            self.device.stop();
        }
    }

    /// Marks the drain thread as exited; the last statement it runs.
    pub(crate) fn note_thread_exit(&self, id: SessionId) {
        let mut st = self.state.lock();
        if let Some(entry) = st.sessions.get_mut(&id) {
            entry.thread_running = false;
        }
        self.thread_exited.notify_all();
    }

    /// Deactivate sessions that reported fatal receive errors, stopping the
    /// device if the last active session went away.
    fn kill_sessions_locked(
        &self,
        mut st: parking_lot::MutexGuard<'_, MuxState>,
        fatal: Vec<SessionId>,
    ) {
        if fatal.is_empty() {
            return;
        }
        for id in fatal {
            tracing::warn!(session = id.0, "receive ring unusable, stopping session");
            self.deactivate_locked(&mut st, id);
        }
        if st.active.is_empty() && st.started {
            st.started = false;
            drop(st);
            self.device.stop();
        }
    }
}

impl EventSink for Mux {
    fn on_status(&self, status: LinkStatus) {
        let mut st = self.state.lock();
        st.link = status;
        // Edge-triggered: set every active session's signal; a client
        // clears its own by reading status.
        for id in &st.active {
            if let Some(entry) = st.sessions.get(id) {
                entry.shared.rx_fifo.signal_status();
            }
        }
    }

    fn on_receive(&self, frame: &[u8]) {
        let mut st = self.state.lock();
        let ids: Vec<SessionId> = st.active.iter().copied().collect();
        let mut fatal = Vec::new();
        for id in ids {
            if let Some(entry) = st.sessions.get(&id) {
                let shared = Arc::clone(&entry.shared);
                if shared.recv_locked(frame, DescFlags::empty()).is_err() {
                    fatal.push(id);
                }
            }
        }
        self.kill_sessions_locked(st, fatal);
    }

    fn on_tx_complete(&self, tag: TxTag, status: TxStatus) {
        let mut st = self.state.lock();
        let Some(entry) = st.sessions.get_mut(&tag.session) else {
            tracing::warn!(session = tag.session.0, "completion for unknown session");
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        let shared = Arc::clone(&entry.shared);
        let reap =
            entry.state == SessionState::Dead && entry.in_flight == 0 && entry.handles == 0;
        if reap {
            st.sessions.remove(&tag.session);
        }
        drop(st);

        // The Arc above keeps the pool and fifo alive even if the session
        // was just reaped: completions never touch freed state.
        match shared.pool.release(tag.slot) {
            Ok(meta) => {
                let mut desc = FrameDesc::new(meta.offset, meta.length, tag.cookie);
                if status == TxStatus::Ok {
                    desc.set_flags(DescFlags::TX_OK);
                }
                match shared.tx_fifo.write(&[desc]) {
                    Ok(1) => {}
                    Ok(_) => {
                        tracing::warn!(
                            session = tag.session.0,
                            "transmit ring full, completion dropped"
                        );
                    }
                    Err(FifoError::Full) | Err(FifoError::Closed) => {}
                }
            }
            Err(err) => {
                tracing::warn!(session = tag.session.0, ?err, "stale transmit completion");
            }
        }
    }
}

/// One open handle to a session.
///
/// Cloning increments the open-handle count; dropping the last handle
/// releases the session's resources (stopping it first if needed).
pub struct Session {
    mux: Arc<Mux>,
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Rename the session (diagnostics only).
    pub fn set_name(&self, name: &str) {
        *self.shared.name.lock() = name.to_owned();
    }

    pub fn name(&self) -> String {
        self.shared.name.lock().clone()
    }

    /// Device capabilities.
    pub fn info(&self) -> DeviceInfo {
        self.mux.info()
    }

    /// Take the client endpoints of the session's fifos. Yields once.
    pub fn take_fifos(&self) -> Option<SessionFifos> {
        self.shared.client_fifos.lock().take()
    }

    /// Bind the shared buffer region. Fails with `AlreadyBound` if a region
    /// is already mapped.
    pub fn bind_buffer(&self, handle: BufferHandle) -> Result<(), Error> {
        self.mux.bind_buffer(&self.shared, handle)
    }

    /// Start the session. Requires a bound buffer; idempotent while
    /// running.
    pub fn start(&self) -> Result<(), Error> {
        self.mux.start_session(self.shared.id)
    }

    /// Stop the session. Always safe to call repeatedly.
    pub fn stop(&self) -> Result<(), Error> {
        self.mux.stop_session(self.shared.id)
    }

    /// Current link status. Reading clears the out-of-band status signal.
    pub fn status(&self) -> Result<LinkStatus, Error> {
        self.mux.status(self.shared.id)
    }

    pub fn set_promiscuous(&self, enable: bool) -> Result<(), Error> {
        self.mux.set_promiscuous(self.shared.id, enable)
    }

    pub fn set_multicast_promiscuous(&self, enable: bool) -> Result<(), Error> {
        self.mux.set_multicast_promiscuous(self.shared.id, enable)
    }

    /// Add a multicast address to the session's filter. Unicast addresses
    /// are rejected with `InvalidArgs` and do not mutate the set.
    pub fn add_multicast(&self, addr: MacAddr) -> Result<(), Error> {
        self.mux.add_multicast(self.shared.id, addr)
    }

    /// Remove a multicast address. Removing an address that was never
    /// tracked succeeds.
    pub fn remove_multicast(&self, addr: MacAddr) -> Result<(), Error> {
        self.mux.remove_multicast(self.shared.id, addr)
    }

    /// Start listening for loopback echoes of transmits. With `loopback`
    /// set, this session's own transmits are echoed as well.
    pub fn listen_start(&self, loopback: bool) -> Result<(), Error> {
        self.mux.set_listen(self.shared.id, true, loopback)
    }

    pub fn listen_stop(&self) -> Result<(), Error> {
        self.mux.set_listen(self.shared.id, false, false)
    }

    pub fn diagnostics(&self) -> Result<SessionDiagnostics, Error> {
        self.mux.session_diagnostics(self.shared.id)
    }
}

impl Clone for Session {
    fn clone(&self) -> Self {
        self.mux.add_handle(self.shared.id);
        Self {
            mux: Arc::clone(&self.mux),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.mux.close_handle(self.shared.id);
    }
}
