//! Camera2Client entry points against a mock device.

mod common;

use common::{wait_until, Harness, EVENT_TIMEOUT, OWNER};
use crabcapture::callbacks::preview_flags;
use crabcapture::device::{DeviceInfo, NotificationListener, StreamConsumer};
use crabcapture::metadata::{AeState, AfState};
use crabcapture::params::{FocusMode, Size, HAL_TRANSFORM_ROT_90};
use crabcapture::testing::{CallbackEvent, MockCall, RecordingCallbacks, TestPreviewWindow};
use crabcapture::{CameraError, CameraState, Command, DeviceVersion, MessageMask, Notification, Sound};
use std::sync::Arc;

#[test]
fn preview_waits_for_window() {
    let harness = Harness::new(DeviceVersion::V2);
    harness.client.start_preview().unwrap();
    assert_eq!(harness.client.parameters().state(), CameraState::WaitingForPreviewWindow);
    assert!(!harness.client.preview_enabled());
    assert!(harness.device.streaming_request().is_none());

    harness.attach_window();
    assert_eq!(harness.client.parameters().state(), CameraState::Preview);
    assert!(harness.client.preview_enabled());

    let request = harness.device.streaming_request().unwrap();
    assert_eq!(request.output_streams, vec![harness.client.preview_stream_id().unwrap()]);

    harness.emit_preview_frames(3);
    assert_eq!(harness.window.buffers_received(), 3);
}

#[test]
fn start_preview_twice_is_harmless() {
    let harness = Harness::previewing(DeviceVersion::V2);
    let before = harness
        .device
        .count_calls(|c| matches!(c, MockCall::SetStreamingRequest { .. }));
    harness.client.start_preview().unwrap();
    let after = harness
        .device
        .count_calls(|c| matches!(c, MockCall::SetStreamingRequest { .. }));
    assert_eq!(before, after);
}

#[test]
fn preview_target_swap_restarts_preview() {
    let harness = Harness::previewing(DeviceVersion::V2);
    let old_stream = harness.client.preview_stream_id().unwrap();

    let replacement = Arc::new(TestPreviewWindow::new());
    let window: Arc<dyn StreamConsumer> = replacement.clone();
    harness.client.set_preview_target(Some(window)).unwrap();

    assert_eq!(harness.client.parameters().state(), CameraState::Preview);
    let new_stream = harness.client.preview_stream_id().unwrap();
    assert_ne!(old_stream, new_stream);
    assert!(harness.device.calls().contains(&MockCall::DeleteStream(old_stream)));

    harness.emit_preview_frames(2);
    assert_eq!(replacement.buffers_received(), 2);
    assert_eq!(harness.window.buffers_received(), 0);
}

#[test]
fn stop_preview_clears_repeating_request() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.stop_preview();
    assert_eq!(harness.client.parameters().state(), CameraState::Stopped);
    assert!(harness.device.streaming_request().is_none());
    assert!(harness.device.calls().contains(&MockCall::WaitUntilDrained));
}

#[test]
fn preview_callbacks_add_callback_stream() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness
        .client
        .set_preview_callback_flag(preview_flags::ENABLE_MASK)
        .unwrap();

    let callback_stream = harness.client.callback_stream_id().expect("callback stream created");
    let request = harness.device.streaming_request().unwrap();
    assert!(request.output_streams.contains(&callback_stream));

    harness.emit_preview_frames(2);
    assert!(harness
        .callbacks
        .wait_for(|e| matches!(e, CallbackEvent::PreviewFrame(_)), EVENT_TIMEOUT));
}

#[test]
fn recording_lends_frames_until_released() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.start_recording().unwrap();
    assert!(harness.client.recording_enabled());
    assert_eq!(harness.client.parameters().state(), CameraState::Record);
    assert_eq!(harness.callbacks.sounds(), vec![Sound::Recording]);

    let request = harness.device.streaming_request().unwrap();
    assert!(request.output_streams.contains(&harness.client.recording_stream_id().unwrap()));

    harness.emit_preview_frames(3);
    assert!(wait_until(EVENT_TIMEOUT, || harness.callbacks.recording_frames().len() == 3));
    assert_eq!(harness.client.streaming_processor().recording_frames_outstanding(), 3);

    let frames = harness.callbacks.recording_frames();
    harness.client.release_recording_frame(&frames[0]).unwrap();
    assert_eq!(harness.client.streaming_processor().recording_frames_outstanding(), 2);
    assert!(matches!(
        harness.client.release_recording_frame(&frames[0]),
        Err(CameraError::BadValue(_))
    ));

    harness.client.stop_recording().unwrap();
    assert_eq!(harness.client.parameters().state(), CameraState::Preview);
    assert_eq!(harness.callbacks.sounds(), vec![Sound::Recording, Sound::Recording]);
}

#[test]
fn new_recording_reclaims_unreturned_frames() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.start_recording().unwrap();
    harness.emit_preview_frames(2);
    assert!(wait_until(EVENT_TIMEOUT, || harness.callbacks.recording_frames().len() == 2));
    harness.client.stop_recording().unwrap();

    harness.client.start_recording().unwrap();
    assert_eq!(harness.client.streaming_processor().recording_frames_outstanding(), 0);
    let stale = harness.callbacks.recording_frames();
    assert!(matches!(
        harness.client.release_recording_frame(&stale[0]),
        Err(CameraError::BadValue(_))
    ));
}

#[test]
fn exhausted_recording_heap_drops_frames() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.send_command(Command::SetVideoBufferCount(2)).unwrap();
    harness.client.start_recording().unwrap();

    harness.emit_preview_frames(4);
    assert!(wait_until(EVENT_TIMEOUT, || harness.callbacks.recording_frames().len() == 2));
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(harness.callbacks.recording_frames().len(), 2);
    assert!(harness.device.released_buffers().len() >= 2);
}

#[test]
fn recording_requires_metadata_mode() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.store_meta_data_in_buffers(false).unwrap();
    let err = harness.client.start_recording().unwrap_err();
    assert!(matches!(err, CameraError::InvalidOperation(_)));
    assert_eq!(harness.client.parameters().state(), CameraState::Preview);
}

#[test]
fn recording_tears_down_preview_callbacks() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness
        .client
        .set_preview_callback_flag(preview_flags::ENABLE_MASK)
        .unwrap();
    assert!(harness.client.callback_stream_id().is_some());

    harness.client.start_recording().unwrap();
    assert!(harness.client.callback_stream_id().is_none());
    assert_eq!(harness.client.parameters().lock().preview_callback_flags, 0);
}

#[test]
fn stop_recording_outside_recording_fails() {
    let harness = Harness::previewing(DeviceVersion::V2);
    assert!(matches!(
        harness.client.stop_recording(),
        Err(CameraError::InvalidOperation(_))
    ));
}

#[test]
fn video_buffer_count_is_bounded_and_fixed_while_recording() {
    let harness = Harness::previewing(DeviceVersion::V2);
    assert!(matches!(
        harness.client.send_command(Command::SetVideoBufferCount(64)),
        Err(CameraError::BadValue(_))
    ));
    harness.client.start_recording().unwrap();
    assert!(matches!(
        harness.client.send_command(Command::SetVideoBufferCount(4)),
        Err(CameraError::InvalidOperation(_))
    ));
}

#[test]
fn session_ownership() {
    let harness = Harness::new(DeviceVersion::V2);
    let other = Arc::new(RecordingCallbacks::new());

    assert_eq!(harness.client.connect(OWNER + 1, other.clone()), Err(CameraError::Busy));
    assert_eq!(harness.client.lock(OWNER + 1), Err(CameraError::Busy));
    assert_eq!(harness.client.unlock(OWNER + 1), Err(CameraError::Busy));

    harness.client.unlock(OWNER).unwrap();
    harness.client.lock(OWNER + 1).unwrap();
    harness.client.connect(OWNER + 1, other).unwrap();
}

#[test]
fn unlock_refused_while_recording() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.start_recording().unwrap();
    assert!(matches!(
        harness.client.unlock(OWNER),
        Err(CameraError::InvalidOperation(_))
    ));
}

#[test]
fn disconnect_is_idempotent_and_final() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.disconnect();
    harness.client.disconnect();

    assert_eq!(harness.client.parameters().state(), CameraState::Disconnected);
    assert!(harness.device.is_disconnected());
    assert_eq!(harness.device.count_calls(|c| *c == MockCall::Disconnect), 1);
    assert!(harness.device.stream_ids().is_empty());
    assert!(!harness.client.callbacks().is_set());
    assert_eq!(harness.client.start_preview(), Err(CameraError::DeadObject));
    assert_eq!(
        harness.client.take_picture(MessageMask::COMPRESSED_IMAGE),
        Err(CameraError::DeadObject)
    );
}

#[test]
fn take_picture_needs_preview() {
    let harness = Harness::new(DeviceVersion::V2);
    assert!(matches!(
        harness.client.take_picture(MessageMask::COMPRESSED_IMAGE),
        Err(CameraError::InvalidOperation(_))
    ));
    assert_eq!(harness.client.parameters().state(), CameraState::Stopped);
}

#[test]
fn busy_stream_is_reconfigured_after_pausing() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.device.emit_ae_state(AeState::Converged);
    harness.client.take_picture(MessageMask::COMPRESSED_IMAGE).unwrap();
    assert!(harness.callbacks.wait_for_image(EVENT_TIMEOUT));
    harness.wait_idle();
    let first_stream = harness.client.capture_stream_id().unwrap();

    harness.client.start_preview().unwrap();
    harness.update_settings(|s| s.picture_size = Size::new(1920, 1080));
    harness.device.set_busy_while_streaming(true);
    harness.callbacks.clear();

    harness.client.take_picture(MessageMask::COMPRESSED_IMAGE).unwrap();
    assert!(harness.callbacks.wait_for_image(EVENT_TIMEOUT));
    harness.wait_idle();
    harness.device.set_busy_while_streaming(false);

    let calls = harness.device.calls();
    let deleted = calls
        .iter()
        .position(|c| *c == MockCall::DeleteStream(first_stream))
        .expect("old capture stream deleted");
    let last_streaming_change = calls[..deleted]
        .iter()
        .rev()
        .find(|c| matches!(c, MockCall::SetStreamingRequest { .. } | MockCall::ClearStreamingRequest));
    assert_eq!(last_streaming_change, Some(&MockCall::ClearStreamingRequest));
    assert!(calls[deleted..]
        .iter()
        .any(|c| matches!(c, MockCall::SetStreamingRequest { .. })));
    assert_ne!(harness.client.capture_stream_id(), Some(first_stream));
}

#[test]
fn autofocus_reports_completion() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.auto_focus().unwrap();

    assert!(harness.device.calls().contains(&MockCall::TriggerAutofocus(2)));
    assert!(harness
        .callbacks
        .wait_for(|e| *e == CallbackEvent::Notify(Notification::Focus { success: true }), EVENT_TIMEOUT));
    assert_eq!(harness.client.parameters().lock().current_af_trigger_id, -1);
}

#[test]
fn autofocus_failure_is_reported() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.device.set_autofocus_result(Some(AfState::NotFocusedLocked));
    harness.client.auto_focus().unwrap();
    assert!(harness
        .callbacks
        .wait_for(|e| *e == CallbackEvent::Notify(Notification::Focus { success: false }), EVENT_TIMEOUT));
}

#[test]
fn fixed_focus_answers_immediately() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.update_settings(|s| s.focus_mode = FocusMode::Infinity);

    harness.client.auto_focus().unwrap();
    assert_eq!(
        harness.callbacks.notifications(),
        vec![Notification::Focus { success: true }]
    );
    assert_eq!(
        harness
            .device
            .count_calls(|c| matches!(c, MockCall::TriggerAutofocus(_))),
        0
    );
}

#[test]
fn autofocus_needs_preview() {
    let harness = Harness::new(DeviceVersion::V2);
    assert!(matches!(
        harness.client.auto_focus(),
        Err(CameraError::InvalidOperation(_))
    ));
}

#[test]
fn cancel_autofocus_triggers_cancel() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.cancel_auto_focus().unwrap();
    assert!(harness
        .device
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::TriggerCancelAutofocus(_))));
}

#[test]
fn autofocus_quirk_forces_auto_mode() {
    let info = DeviceInfo {
        trigger_af_with_auto: true,
        ..DeviceInfo::default()
    };
    let harness = Harness::with_info(DeviceVersion::V2, info, true);
    harness.attach_window();
    harness.client.start_preview().unwrap();
    harness.update_settings(|s| s.focus_mode = FocusMode::ContinuousPicture);
    harness.device.set_autofocus_result(None);

    harness.client.auto_focus().unwrap();
    {
        let params = harness.client.parameters().lock();
        assert_eq!(params.focus_mode, FocusMode::Auto);
        assert_eq!(params.shadow_focus_mode, Some(FocusMode::ContinuousPicture));
    }
    assert_eq!(harness.client.get_parameters().focus_mode, FocusMode::ContinuousPicture);

    harness.client.cancel_auto_focus().unwrap();
    let params = harness.client.parameters().lock();
    assert_eq!(params.focus_mode, FocusMode::ContinuousPicture);
    assert_eq!(params.shadow_focus_mode, None);
}

#[test]
fn continuous_focus_sends_move_messages() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.update_settings(|s| s.focus_mode = FocusMode::ContinuousPicture);
    harness
        .client
        .send_command(Command::EnableFocusMoveMessages(true))
        .unwrap();

    harness.client.notify_auto_focus(AfState::PassiveScan, 0);
    harness.client.notify_auto_focus(AfState::PassiveFocused, 0);

    assert_eq!(
        harness.callbacks.notifications(),
        vec![
            Notification::FocusMove { moving: true },
            Notification::FocusMove { moving: false },
        ]
    );
}

#[test]
fn face_detection_requires_preview_and_support() {
    let harness = Harness::new(DeviceVersion::V2);
    assert!(matches!(
        harness.client.send_command(Command::StartFaceDetection),
        Err(CameraError::InvalidOperation(_))
    ));

    let no_faces = DeviceInfo {
        max_faces: 0,
        ..DeviceInfo::default()
    };
    let unsupported = Harness::with_info(DeviceVersion::V2, no_faces, true);
    unsupported.attach_window();
    unsupported.client.start_preview().unwrap();
    assert!(matches!(
        unsupported.client.send_command(Command::StartFaceDetection),
        Err(CameraError::BadValue(_))
    ));
}

#[test]
fn face_detection_updates_requests() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.send_command(Command::StartFaceDetection).unwrap();
    let request = harness.device.streaming_request().unwrap();
    assert_eq!(
        request.face_detect_mode,
        Some(crabcapture::metadata::FaceDetectMode::Full)
    );

    harness.client.send_command(Command::StopFaceDetection).unwrap();
    let request = harness.device.streaming_request().unwrap();
    assert_eq!(request.face_detect_mode, Some(crabcapture::metadata::FaceDetectMode::Off));
}

#[test]
fn display_orientation_sets_preview_transform() {
    let harness = Harness::previewing(DeviceVersion::V2);
    harness.client.send_command(Command::SetDisplayOrientation(90)).unwrap();
    let preview = harness.client.preview_stream_id().unwrap();
    assert!(harness.device.calls().contains(&MockCall::SetStreamTransform {
        id: preview,
        transform: HAL_TRANSFORM_ROT_90
    }));
    assert!(matches!(
        harness.client.send_command(Command::SetDisplayOrientation(45)),
        Err(CameraError::BadValue(_))
    ));
    assert_eq!(harness.client.send_command(Command::Ping), Ok(()));
}

#[test]
fn rejected_settings_change_nothing() {
    let harness = Harness::previewing(DeviceVersion::V2);
    let before = harness.client.get_parameters();
    let mut settings = before.clone();
    settings.jpeg_quality = 0;
    settings.zsl_mode = true;

    assert!(matches!(
        harness.client.set_parameters(settings),
        Err(CameraError::BadValue(_))
    ));
    assert_eq!(harness.client.get_parameters(), before);
}

#[test]
fn new_settings_move_preview_to_fresh_request_id() {
    let harness = Harness::previewing(DeviceVersion::V2);
    let first = harness.device.streaming_request().unwrap().request_id.unwrap();
    harness.update_settings(|s| s.video_stabilization = true);
    let second = harness.device.streaming_request().unwrap();
    assert_eq!(second.request_id, Some(first + 1));
    assert_eq!(second.video_stabilization, Some(true));
    assert!(harness.client.sync_with_device().is_ok());
}

#[test]
fn device_errors_reach_the_client() {
    let harness = Harness::new(DeviceVersion::V2);
    harness.client.notify_error(3, 0, 0);
    assert_eq!(
        harness.callbacks.notifications(),
        vec![Notification::Error { code: 3 }]
    );
}

#[test]
fn dump_describes_state() {
    let harness = Harness::previewing(DeviceVersion::V3);
    let dump = harness.client.dump().unwrap();
    let value: serde_json::Value = serde_json::from_str(&dump).unwrap();
    assert_eq!(value["state"], "PREVIEW");
    assert_eq!(value["capture_state"], "IDLE");
    assert_eq!(value["owner"], OWNER);
}

#[test]
fn second_initialize_is_rejected() {
    let harness = Harness::new(DeviceVersion::V2);
    assert_eq!(harness.client.initialize(), Err(CameraError::AlreadyActive));
}
