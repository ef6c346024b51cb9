//! In-memory capture device
//!
//! [`MockCameraDevice`] implements [`CameraDevice`] well enough to drive the
//! whole client: streams are bookkept, one-shot captures immediately produce
//! output buffers and a result frame, and 3A triggers answer from a helper
//! thread the way a HAL would. Every call is recorded, failures can be
//! injected per operation, and captures can be made to stall.
//!
//! Consumers and listeners are always invoked with the device lock released.

use super::synthetic_data::{synthetic_jpeg, synthetic_result_frame, Synthetic3a};
use crate::device::{
    BufferReleasedListener, CameraBuffer, CameraDevice, DeviceInfo, DeviceVersion, NotificationListener,
    PixelFormat, StreamConsumer, StreamId, StreamInfo,
};
use crate::errors::{recover, CameraError};
use crate::metadata::{AeState, AfState, CameraMetadata, RequestTemplate, RequestType};
use crate::request_ids::PREVIEW_REQUEST_IDS;
use crate::timing::SensorClock;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

const DELIVERED_HISTORY: usize = 64;
const JPEG_PAYLOAD: usize = 256;
const JPEG_PADDING: usize = 128;
const PREVIEW_BUFFER_LEN: usize = 64;
const TRIGGER_STEP: Duration = Duration::from_millis(30);

/// Operations that accept an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateStream,
    DeleteStream,
    CreateDefaultRequest,
    SetStreamingRequest,
    ClearStreamingRequest,
    Capture,
    TriggerPrecapture,
    TriggerAutofocus,
    WaitUntilDrained,
    PushReprocessBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateStream {
        id: StreamId,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    CreateReprocessStream {
        id: StreamId,
        output: StreamId,
    },
    DeleteStream(StreamId),
    DeleteReprocessStream(StreamId),
    SetStreamTransform {
        id: StreamId,
        transform: i32,
    },
    SetStreamingRequest {
        request_id: Option<i32>,
        outputs: Vec<StreamId>,
    },
    ClearStreamingRequest,
    Capture {
        request_id: Option<i32>,
        outputs: Vec<StreamId>,
        reprocess: bool,
    },
    TriggerAutofocus(i32),
    TriggerCancelAutofocus(i32),
    TriggerPrecapture(i32),
    PushReprocessBuffer {
        stream: StreamId,
        buffer_id: u64,
    },
    WaitUntilDrained,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Output,
    InputOutput,
    Reprocess,
}

struct MockStream {
    info: StreamInfo,
    kind: StreamKind,
    consumer: Option<Weak<dyn StreamConsumer>>,
    released: Option<Weak<dyn BufferReleasedListener>>,
}

struct Delivery {
    consumer: Weak<dyn StreamConsumer>,
    buffer: CameraBuffer,
}

#[derive(Debug, Clone, Copy)]
enum ThreeA {
    Ae,
    Af,
}

struct MockState {
    next_stream_id: StreamId,
    next_buffer_id: u64,
    frame_count: i32,
    streams: BTreeMap<StreamId, MockStream>,
    streaming_request: Option<CameraMetadata>,
    received: Vec<i32>,
    frames: VecDeque<CameraMetadata>,
    alg: Synthetic3a,
    calls: Vec<MockCall>,
    captures: Vec<CameraMetadata>,
    released: Vec<(StreamId, u64)>,
    delivered: VecDeque<CameraBuffer>,
    pending_reprocess: Option<(CameraBuffer, Weak<dyn BufferReleasedListener>)>,
    failures: HashMap<MockOp, VecDeque<CameraError>>,
    notify: Option<Weak<dyn NotificationListener>>,
    stall_captures: bool,
    busy_while_streaming: bool,
    precapture_response: bool,
    autofocus_result: Option<AfState>,
    disconnected: bool,
}

impl MockState {
    fn check(&mut self, op: Option<MockOp>) -> Result<(), CameraError> {
        if self.disconnected {
            return Err(CameraError::DeadObject);
        }
        if let Some(op) = op {
            if let Some(err) = self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn allocate_stream(&mut self, stream: MockStream) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id, stream);
        id
    }

    fn prepare_outputs(&mut self, outputs: &[StreamId], timestamp: i64) -> Result<Vec<Delivery>, CameraError> {
        let mut deliveries = Vec::with_capacity(outputs.len());
        for id in outputs {
            let stream = self
                .streams
                .get(id)
                .ok_or_else(|| CameraError::bad_value(format!("unknown output stream {}", id)))?;
            let Some(consumer) = stream.consumer.clone() else {
                continue;
            };
            let format = stream.info.format;

            self.next_buffer_id += 1;
            let buffer_id = self.next_buffer_id;
            let data = if format == PixelFormat::Blob {
                synthetic_jpeg(buffer_id as u8, JPEG_PAYLOAD, JPEG_PADDING)
            } else {
                Bytes::from(vec![(buffer_id % 251) as u8; PREVIEW_BUFFER_LEN])
            };
            let buffer = CameraBuffer {
                id: buffer_id,
                stream_id: *id,
                timestamp,
                data,
            };
            if self.delivered.len() >= DELIVERED_HISTORY {
                self.delivered.pop_front();
            }
            self.delivered.push_back(buffer.clone());
            deliveries.push(Delivery { consumer, buffer });
        }
        Ok(deliveries)
    }

    fn push_frame(&mut self, request_id: i32, timestamp: i64) -> CameraMetadata {
        self.frame_count += 1;
        let frame = synthetic_result_frame(request_id, self.frame_count, timestamp, self.alg);
        self.frames.push_back(frame.clone());
        frame
    }
}

pub struct MockCameraDevice {
    id: i32,
    version: DeviceVersion,
    info: DeviceInfo,
    will_notify_3a: bool,
    clock: SensorClock,
    self_ref: Weak<MockCameraDevice>,
    state: Mutex<MockState>,
    frame_available: Condvar,
}

impl MockCameraDevice {
    /// A device with default static info that reports 3A changes itself.
    pub fn new(id: i32, version: DeviceVersion) -> Arc<Self> {
        Self::with_info(id, version, DeviceInfo::default(), true)
    }

    pub fn with_info(id: i32, version: DeviceVersion, info: DeviceInfo, will_notify_3a: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            version,
            info,
            will_notify_3a,
            clock: SensorClock::new(),
            self_ref: self_ref.clone(),
            state: Mutex::new(MockState {
                next_stream_id: 1,
                next_buffer_id: 0,
                frame_count: 0,
                streams: BTreeMap::new(),
                streaming_request: None,
                received: Vec::new(),
                frames: VecDeque::new(),
                alg: Synthetic3a::default(),
                calls: Vec::new(),
                captures: Vec::new(),
                released: Vec::new(),
                delivered: VecDeque::new(),
                pending_reprocess: None,
                failures: HashMap::new(),
                notify: None,
                stall_captures: false,
                busy_while_streaming: false,
                precapture_response: true,
                autofocus_result: Some(AfState::FocusedLocked),
                disconnected: false,
            }),
            frame_available: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(recover)
    }

    fn deliver(deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if let Some(consumer) = delivery.consumer.upgrade() {
                consumer.on_buffer_available(delivery.buffer);
            }
        }
    }

    // Test controls

    /// Fail the next call of `op` with `error`. Queued failures are used in order.
    pub fn fail_next(&self, op: MockOp, error: CameraError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Accept captures without producing any output.
    pub fn set_stall_captures(&self, stall: bool) {
        self.state().stall_captures = stall;
    }

    /// Report `Busy` when deleting a stream while a repeating request runs.
    pub fn set_busy_while_streaming(&self, busy: bool) {
        self.state().busy_while_streaming = busy;
    }

    /// Whether precapture triggers are answered with AE transitions.
    pub fn set_precapture_response(&self, respond: bool) {
        self.state().precapture_response = respond;
    }

    /// Final AF state reported after an autofocus trigger, or none at all.
    pub fn set_autofocus_result(&self, result: Option<AfState>) {
        self.state().autofocus_result = result;
    }

    /// Change the AE state stamped into later frames without notifying.
    pub fn set_ae_state(&self, state: AeState) {
        self.state().alg.ae_state = state;
    }

    /// Change the AE state and report it like a HAL would.
    pub fn emit_ae_state(&self, state: AeState) {
        self.apply_3a(ThreeA::Ae, |alg| alg.ae_state = state);
    }

    /// Produce one frame of the running repeating request. Returns its
    /// sensor timestamp.
    pub fn emit_preview_frame(&self) -> Result<i64, CameraError> {
        let deliveries = {
            let mut st = self.state();
            st.check(None)?;
            let request = st
                .streaming_request
                .clone()
                .ok_or_else(|| CameraError::invalid_operation("no repeating request"))?;
            let timestamp = self.clock.now_ns();
            let deliveries = st.prepare_outputs(&request.output_streams, timestamp)?;
            st.push_frame(request.request_id.unwrap_or(PREVIEW_REQUEST_IDS.start), timestamp);
            (deliveries, timestamp)
        };
        self.frame_available.notify_all();
        let (deliveries, timestamp) = deliveries;
        Self::deliver(deliveries);
        Ok(timestamp)
    }

    /// Queue an arbitrary result frame for the frame processor.
    pub fn push_result_frame(&self, frame: CameraMetadata) {
        self.state().frames.push_back(frame);
        self.frame_available.notify_all();
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Every one-shot request submitted, in order.
    pub fn captures(&self) -> Vec<CameraMetadata> {
        self.state().captures.clone()
    }

    pub fn released_buffers(&self) -> Vec<(StreamId, u64)> {
        self.state().released.clone()
    }

    pub fn streaming_request(&self) -> Option<CameraMetadata> {
        self.state().streaming_request.clone()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.state().streams.keys().copied().collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().disconnected
    }

    pub fn clock(&self) -> &SensorClock {
        &self.clock
    }

    fn apply_3a(&self, kind: ThreeA, update: impl FnOnce(&mut Synthetic3a)) {
        let listener = {
            let mut st = self.state();
            if st.disconnected {
                return;
            }
            update(&mut st.alg);
            if self.will_notify_3a {
                st.notify.clone().map(|listener| (listener, st.alg))
            } else {
                let request_id = st
                    .streaming_request
                    .as_ref()
                    .and_then(|r| r.request_id)
                    .unwrap_or(PREVIEW_REQUEST_IDS.start);
                let timestamp = self.clock.now_ns();
                st.push_frame(request_id, timestamp);
                None
            }
        };

        let Some((listener, alg)) = listener else {
            self.frame_available.notify_all();
            return;
        };
        let Some(listener) = listener.upgrade() else {
            return;
        };
        match kind {
            ThreeA::Ae => listener.notify_auto_exposure(alg.ae_state, alg.ae_precapture_id),
            ThreeA::Af => listener.notify_auto_focus(alg.af_state, alg.af_trigger_id),
        }
    }

    fn spawn_3a_sequence(&self, kind: ThreeA, trigger_id: i32, states: Vec<Step>) {
        let device = self.self_ref.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("mock-{}-3a", self.id))
            .spawn(move || {
                for step in states {
                    std::thread::sleep(TRIGGER_STEP);
                    let Some(device) = device.upgrade() else {
                        return;
                    };
                    device.apply_3a(kind, |alg| match step {
                        Step::Ae(state) => {
                            alg.ae_state = state;
                            alg.ae_precapture_id = trigger_id;
                        }
                        Step::Af(state) => {
                            alg.af_state = state;
                            alg.af_trigger_id = trigger_id;
                        }
                    });
                }
            });
        if let Err(e) = spawned {
            log::error!("mock device {}: unable to spawn 3A thread: {}", self.id, e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Ae(AeState),
    Af(AfState),
}

impl CameraDevice for MockCameraDevice {
    fn id(&self) -> i32 {
        self.id
    }

    fn version(&self) -> DeviceVersion {
        self.version
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn will_notify_3a(&self) -> bool {
        self.will_notify_3a
    }

    fn set_notify_callback(&self, listener: Option<Weak<dyn NotificationListener>>) {
        self.state().notify = listener;
    }

    fn create_stream(
        &self,
        consumer: Weak<dyn StreamConsumer>,
        width: u32,
        height: u32,
        format: PixelFormat,
        _size: usize,
    ) -> Result<StreamId, CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::CreateStream))?;
        let id = st.allocate_stream(MockStream {
            info: StreamInfo { width, height, format },
            kind: StreamKind::Output,
            consumer: Some(consumer),
            released: None,
        });
        st.calls.push(MockCall::CreateStream {
            id,
            width,
            height,
            format,
        });
        Ok(id)
    }

    fn create_input_output_stream(
        &self,
        consumer: Weak<dyn StreamConsumer>,
        released: Weak<dyn BufferReleasedListener>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<StreamId, CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::CreateStream))?;
        let id = st.allocate_stream(MockStream {
            info: StreamInfo { width, height, format },
            kind: StreamKind::InputOutput,
            consumer: Some(consumer),
            released: Some(released),
        });
        st.calls.push(MockCall::CreateStream {
            id,
            width,
            height,
            format,
        });
        Ok(id)
    }

    fn create_reprocess_stream_from_stream(&self, output_id: StreamId) -> Result<StreamId, CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::CreateStream))?;
        let info = st
            .streams
            .get(&output_id)
            .map(|s| s.info)
            .ok_or_else(|| CameraError::bad_value(format!("unknown stream {}", output_id)))?;
        let id = st.allocate_stream(MockStream {
            info,
            kind: StreamKind::Reprocess,
            consumer: None,
            released: None,
        });
        st.calls.push(MockCall::CreateReprocessStream { id, output: output_id });
        Ok(id)
    }

    fn get_stream_info(&self, id: StreamId) -> Result<StreamInfo, CameraError> {
        let mut st = self.state();
        st.check(None)?;
        st.streams
            .get(&id)
            .map(|s| s.info)
            .ok_or_else(|| CameraError::bad_value(format!("unknown stream {}", id)))
    }

    fn set_stream_transform(&self, id: StreamId, transform: i32) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(None)?;
        if !st.streams.contains_key(&id) {
            return Err(CameraError::bad_value(format!("unknown stream {}", id)));
        }
        st.calls.push(MockCall::SetStreamTransform { id, transform });
        Ok(())
    }

    fn delete_stream(&self, id: StreamId) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::DeleteStream))?;
        if st.busy_while_streaming && st.streaming_request.is_some() {
            return Err(CameraError::Busy);
        }
        match st.streams.get(&id).map(|s| s.kind) {
            Some(StreamKind::Output) | Some(StreamKind::InputOutput) => {
                st.streams.remove(&id);
                st.calls.push(MockCall::DeleteStream(id));
                Ok(())
            }
            _ => Err(CameraError::bad_value(format!("no output stream {}", id))),
        }
    }

    fn delete_reprocess_stream(&self, id: StreamId) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::DeleteStream))?;
        match st.streams.get(&id).map(|s| s.kind) {
            Some(StreamKind::Reprocess) => {
                st.streams.remove(&id);
                st.calls.push(MockCall::DeleteReprocessStream(id));
                Ok(())
            }
            _ => Err(CameraError::bad_value(format!("no reprocess stream {}", id))),
        }
    }

    fn create_default_request(&self, template: RequestTemplate) -> Result<CameraMetadata, CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::CreateDefaultRequest))?;
        Ok(CameraMetadata::from_template(template))
    }

    fn set_streaming_request(&self, request: &CameraMetadata) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::SetStreamingRequest))?;
        if let Some(missing) = request.output_streams.iter().find(|id| !st.streams.contains_key(id)) {
            return Err(CameraError::bad_value(format!("unknown output stream {}", missing)));
        }
        st.calls.push(MockCall::SetStreamingRequest {
            request_id: request.request_id,
            outputs: request.output_streams.clone(),
        });
        if let Some(id) = request.request_id {
            st.received.push(id);
        }
        st.streaming_request = Some(request.clone());
        Ok(())
    }

    fn clear_streaming_request(&self) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::ClearStreamingRequest))?;
        st.calls.push(MockCall::ClearStreamingRequest);
        st.streaming_request = None;
        Ok(())
    }

    fn capture(&self, request: CameraMetadata) -> Result<(), CameraError> {
        let reprocess = request.request_type == Some(RequestType::Reprocess);
        let (deliveries, released, listener, timestamp) = {
            let mut st = self.state();
            st.check(Some(MockOp::Capture))?;
            st.calls.push(MockCall::Capture {
                request_id: request.request_id,
                outputs: request.output_streams.clone(),
                reprocess,
            });
            st.captures.push(request.clone());
            if let Some(id) = request.request_id {
                st.received.push(id);
            }
            if st.stall_captures {
                return Ok(());
            }

            let mut released = None;
            let timestamp = if !reprocess {
                self.clock.now_ns()
            } else if let Some(ts) = request.input_buffer_timestamp {
                let input = request.input_streams.first().copied();
                let buffer_id = st
                    .delivered
                    .iter()
                    .find(|b| Some(b.stream_id) == input && b.timestamp == ts)
                    .map(|b| b.id);
                let listener = input
                    .and_then(|id| st.streams.get(&id))
                    .and_then(|s| s.released.clone());
                if let (Some(id), Some(listener)) = (buffer_id, listener) {
                    released = Some((listener, id));
                }
                ts
            } else if let Some((buffer, listener)) = st.pending_reprocess.take() {
                released = Some((listener, buffer.id));
                buffer.timestamp
            } else {
                return Err(CameraError::bad_value("reprocess request without an input buffer"));
            };

            let deliveries = st.prepare_outputs(&request.output_streams, timestamp)?;
            let mut frame = st.push_frame(request.request_id.unwrap_or(0), timestamp);
            frame.request_type = request.request_type;
            frame.capture_intent = request.capture_intent;
            if let Some(last) = st.frames.back_mut() {
                *last = frame;
            }
            (deliveries, released, st.notify.clone(), timestamp)
        };

        self.frame_available.notify_all();
        if let Some(listener) = listener.and_then(|l| l.upgrade()) {
            listener.notify_shutter(request.request_id.unwrap_or(0), timestamp);
        }
        Self::deliver(deliveries);
        if let Some((listener, buffer_id)) = released {
            if let Some(listener) = listener.upgrade() {
                listener.on_buffer_released(buffer_id);
            }
        }
        Ok(())
    }

    fn wait_until_request_received(&self, request_id: i32, _timeout: Duration) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(None)?;
        if st.received.contains(&request_id) {
            Ok(())
        } else {
            Err(CameraError::TimedOut)
        }
    }

    fn wait_until_drained(&self) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::WaitUntilDrained))?;
        st.calls.push(MockCall::WaitUntilDrained);
        Ok(())
    }

    fn wait_for_next_frame(&self, timeout: Duration) -> Result<(), CameraError> {
        let st = self.state();
        let (st, _) = self
            .frame_available
            .wait_timeout_while(st, timeout, |s| s.frames.is_empty() && !s.disconnected)
            .unwrap_or_else(recover);
        if st.frames.is_empty() {
            Err(CameraError::TimedOut)
        } else {
            Ok(())
        }
    }

    fn get_next_frame(&self) -> Result<Option<CameraMetadata>, CameraError> {
        Ok(self.state().frames.pop_front())
    }

    fn trigger_autofocus(&self, trigger_id: i32) -> Result<(), CameraError> {
        let result = {
            let mut st = self.state();
            st.check(Some(MockOp::TriggerAutofocus))?;
            st.calls.push(MockCall::TriggerAutofocus(trigger_id));
            st.autofocus_result
        };
        if let Some(result) = result {
            self.spawn_3a_sequence(
                ThreeA::Af,
                trigger_id,
                vec![Step::Af(AfState::ActiveScan), Step::Af(result)],
            );
        }
        Ok(())
    }

    fn trigger_cancel_autofocus(&self, trigger_id: i32) -> Result<(), CameraError> {
        {
            let mut st = self.state();
            st.check(None)?;
            st.calls.push(MockCall::TriggerCancelAutofocus(trigger_id));
        }
        self.apply_3a(ThreeA::Af, |alg| {
            alg.af_state = AfState::Inactive;
            alg.af_trigger_id = trigger_id;
        });
        Ok(())
    }

    fn trigger_precapture_metering(&self, trigger_id: i32) -> Result<(), CameraError> {
        let respond = {
            let mut st = self.state();
            st.check(Some(MockOp::TriggerPrecapture))?;
            st.calls.push(MockCall::TriggerPrecapture(trigger_id));
            st.precapture_response
        };
        if respond {
            self.spawn_3a_sequence(
                ThreeA::Ae,
                trigger_id,
                vec![Step::Ae(AeState::Precapture), Step::Ae(AeState::Converged)],
            );
        }
        Ok(())
    }

    fn push_reprocess_buffer(
        &self,
        reprocess_stream_id: StreamId,
        buffer: &CameraBuffer,
        listener: Weak<dyn BufferReleasedListener>,
    ) -> Result<(), CameraError> {
        let mut st = self.state();
        st.check(Some(MockOp::PushReprocessBuffer))?;
        if st.streams.get(&reprocess_stream_id).map(|s| s.kind) != Some(StreamKind::Reprocess) {
            return Err(CameraError::bad_value(format!(
                "no reprocess stream {}",
                reprocess_stream_id
            )));
        }
        st.calls.push(MockCall::PushReprocessBuffer {
            stream: reprocess_stream_id,
            buffer_id: buffer.id,
        });
        st.pending_reprocess = Some((buffer.clone(), listener));
        Ok(())
    }

    fn release_buffer(&self, stream_id: StreamId, buffer_id: u64) -> Result<(), CameraError> {
        self.state().released.push((stream_id, buffer_id));
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut st = self.state();
            st.calls.push(MockCall::Disconnect);
            st.disconnected = true;
            st.streaming_request = None;
            st.notify = None;
        }
        self.frame_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink(Mutex<Vec<CameraBuffer>>);

    impl StreamConsumer for Sink {
        fn on_buffer_available(&self, buffer: CameraBuffer) {
            self.0.lock().unwrap().push(buffer);
        }
    }

    #[test]
    fn test_capture_fills_outputs_and_queues_frame() {
        let device = MockCameraDevice::new(0, DeviceVersion::V3);
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let weak: Weak<dyn StreamConsumer> = Arc::downgrade(&sink) as Weak<dyn StreamConsumer>;
        let id = device.create_stream(weak, 640, 480, PixelFormat::Blob, 0).unwrap();

        let mut request = CameraMetadata::from_template(RequestTemplate::StillCapture);
        request.request_id = Some(30_000_000);
        request.output_streams = vec![id];
        device.capture(request).unwrap();

        let buffers = sink.0.lock().unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].data[..2], [0xFF, 0xD8]);
        device.wait_for_next_frame(Duration::from_millis(10)).unwrap();
        let frame = device.get_next_frame().unwrap().unwrap();
        assert_eq!(frame.request_id, Some(30_000_000));
        assert_eq!(frame.sensor_timestamp, Some(buffers[0].timestamp));
    }

    #[test]
    fn test_injected_failure_is_used_once() {
        let device = MockCameraDevice::new(0, DeviceVersion::V2);
        device.fail_next(MockOp::WaitUntilDrained, CameraError::device("hal"));
        assert!(device.wait_until_drained().is_err());
        assert!(device.wait_until_drained().is_ok());
    }

    #[test]
    fn test_busy_delete_while_streaming() {
        let device = MockCameraDevice::new(0, DeviceVersion::V2);
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let weak: Weak<dyn StreamConsumer> = Arc::downgrade(&sink) as Weak<dyn StreamConsumer>;
        let id = device.create_stream(weak, 640, 480, PixelFormat::Opaque, 0).unwrap();
        let mut request = CameraMetadata::from_template(RequestTemplate::Preview);
        request.output_streams = vec![id];
        device.set_streaming_request(&request).unwrap();
        device.set_busy_while_streaming(true);

        assert_eq!(device.delete_stream(id), Err(CameraError::Busy));
        device.clear_streaming_request().unwrap();
        assert!(device.delete_stream(id).is_ok());
    }

    #[test]
    fn test_no_frame_times_out() {
        let device = MockCameraDevice::new(0, DeviceVersion::V2);
        assert_eq!(
            device.wait_for_next_frame(Duration::from_millis(1)),
            Err(CameraError::TimedOut)
        );
    }
}
