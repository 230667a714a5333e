//! ethmux-testkit: test doubles and helpers for the ethmux test suites.
//!
//! The centerpiece is [`MockDevice`], a scriptable [`NetDevice`] that
//! records every parameter push and captured transmit, can complete
//! transmits automatically or on demand, and lets tests inject receive and
//! status events as if they came from hardware.
//!
//! ```ignore
//! let device = Arc::new(MockDevice::new());
//! let mux = Mux::new(device.clone());
//! // ... drive the mux, then assert on device.params() / device.transmits()
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ethmux_core::{
    DeviceError, DeviceInfo, DmaHandle, EventSink, LinkStatus, MacAddr, NetDevice, Param,
    TxFrame, TxStatus, TxTag,
};

/// One transmit the device accepted, with the payload copied out at
/// queue time (the way real hardware would DMA it).
#[derive(Debug, Clone)]
pub struct CapturedTx {
    pub bytes: Vec<u8>,
    pub tag: TxTag,
    pub more: bool,
}

struct MockState {
    sink: Option<Arc<dyn EventSink>>,
    start_count: u32,
    stop_count: u32,
    params: Vec<Param>,
    tx: Vec<CapturedTx>,
    /// Tags awaiting manual completion (empty in auto-complete mode).
    pending: VecDeque<TxTag>,
    auto_complete: bool,
    fail_start: bool,
    fail_params: bool,
    initial_link: Option<LinkStatus>,
}

/// A scriptable in-memory device.
pub struct MockDevice {
    info: DeviceInfo,
    broken_dma: bool,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
                mtu: 1500,
                max_tx_buffer_size: 16 * 1024,
                dma_capable: false,
            },
            broken_dma: false,
            state: Mutex::new(MockState {
                sink: None,
                start_count: 0,
                stop_count: 0,
                params: Vec::new(),
                tx: Vec::new(),
                pending: VecDeque::new(),
                auto_complete: true,
                fail_start: false,
                fail_params: false,
                initial_link: Some(LinkStatus::ONLINE),
            }),
        }
    }

    /// Report `dma_capable` and hand out a DMA handle.
    pub fn with_dma(mut self) -> Self {
        self.info.dma_capable = true;
        self
    }

    /// Report `dma_capable` but refuse to produce the DMA handle, so
    /// binding a buffer fails at pin time.
    pub fn with_broken_dma(mut self) -> Self {
        self.info.dma_capable = true;
        self.broken_dma = true;
        self
    }

    pub fn with_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Hold completions until [`complete_next`](Self::complete_next).
    pub fn manual_completion(self) -> Self {
        self.state.lock().auto_complete = false;
        self
    }

    /// Suppress the initial `on_status` normally delivered from `start`.
    pub fn without_initial_link(self) -> Self {
        self.state.lock().initial_link = None;
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn set_fail_params(&self, fail: bool) {
        self.state.lock().fail_params = fail;
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.state.lock().sink.clone()
    }

    /// Inject a received frame, as the hardware receive path would.
    pub fn deliver_receive(&self, frame: &[u8]) {
        if let Some(sink) = self.sink() {
            sink.on_receive(frame);
        }
    }

    /// Report a link status change.
    pub fn set_link(&self, status: LinkStatus) {
        if let Some(sink) = self.sink() {
            sink.on_status(status);
        }
    }

    /// Complete the oldest pending transmit (manual mode). Returns false
    /// when nothing is pending.
    pub fn complete_next(&self, status: TxStatus) -> bool {
        let (sink, tag) = {
            let mut st = self.state.lock();
            let Some(tag) = st.pending.pop_front() else {
                return false;
            };
            (st.sink.clone(), tag)
        };
        if let Some(sink) = sink {
            sink.on_tx_complete(tag, status);
        }
        true
    }

    /// Every parameter pushed so far, in order.
    pub fn params(&self) -> Vec<Param> {
        self.state.lock().params.clone()
    }

    /// The most recent parameter push.
    pub fn last_param(&self) -> Option<Param> {
        self.state.lock().params.last().cloned()
    }

    /// How many pushed parameters satisfy `matches`.
    pub fn count_params(&self, matches: impl Fn(&Param) -> bool) -> usize {
        self.state.lock().params.iter().filter(|p| matches(p)).count()
    }

    /// Every transmit accepted so far.
    pub fn transmits(&self) -> Vec<CapturedTx> {
        self.state.lock().tx.clone()
    }

    pub fn pending_completions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().start_count
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().stop_count
    }
}

impl NetDevice for MockDevice {
    fn query(&self) -> DeviceInfo {
        self.info
    }

    fn start(&self, sink: Arc<dyn EventSink>) -> Result<(), DeviceError> {
        let initial = {
            let mut st = self.state.lock();
            if st.fail_start {
                return Err(DeviceError::StartFailed);
            }
            st.sink = Some(Arc::clone(&sink));
            st.start_count += 1;
            st.initial_link
        };
        // Real devices report status as soon as the sink is live, possibly
        // before start() returns; exercise that reentrancy.
        if let Some(link) = initial {
            sink.on_status(link);
        }
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().stop_count += 1;
    }

    fn queue_transmit(&self, frame: TxFrame, more: bool) {
        let tag = frame.tag;
        let sink = {
            let mut st = self.state.lock();
            st.tx.push(CapturedTx {
                bytes: frame.payload.bytes().to_vec(),
                tag,
                more,
            });
            if st.auto_complete {
                st.sink.clone()
            } else {
                st.pending.push_back(tag);
                None
            }
        };
        // The sink call re-enters the multiplexer; never hold our lock
        // across it.
        if let Some(sink) = sink {
            sink.on_tx_complete(tag, TxStatus::Ok);
        }
    }

    fn set_parameter(&self, param: Param) -> Result<(), DeviceError> {
        let mut st = self.state.lock();
        if st.fail_params {
            return Err(DeviceError::ParamRejected);
        }
        st.params.push(param);
        Ok(())
    }

    fn dma_handle(&self) -> Option<DmaHandle> {
        (self.info.dma_capable && !self.broken_dma).then_some(DmaHandle(0x1000))
    }
}

/// A multicast test address (group bit set) ending in `last`.
pub fn multicast_addr(last: u8) -> MacAddr {
    MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, last])
}

/// A unicast test address ending in `last`.
pub fn unicast_addr(last: u8) -> MacAddr {
    MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, last])
}

/// Poll `cond` until it holds or `timeout` elapses. The multiplexer's drain
/// threads run asynchronously; tests use this instead of bare sleeps.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
