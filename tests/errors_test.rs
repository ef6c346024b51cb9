#[cfg(test)]
mod error_tests {
    use crabcapture::errors::CameraError;
    use std::error::Error;

    #[test]
    fn test_invalid_operation_message() {
        let error = CameraError::invalid_operation("take picture needs preview");
        assert!(error.to_string().contains("Invalid operation"));
        assert!(error.to_string().contains("take picture needs preview"));
    }

    #[test]
    fn test_bad_value_message() {
        let error = CameraError::bad_value("JPEG quality must be within 1..=100");
        assert_eq!(error.to_string(), "Bad value: JPEG quality must be within 1..=100");
    }

    #[test]
    fn test_status_variants_display() {
        assert_eq!(CameraError::Busy.to_string(), "Device or resource busy");
        assert_eq!(CameraError::DeadObject.to_string(), "Device is gone");
        assert_eq!(CameraError::TimedOut.to_string(), "Timed out");
        assert_eq!(CameraError::NoInit.to_string(), "Not initialized");
    }

    #[test]
    fn test_debug_format() {
        let error = CameraError::device("stream configuration failed");
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("Device"));
        assert!(debug_str.contains("stream configuration failed"));
    }

    #[test]
    fn test_only_timeout_is_timeout() {
        assert!(CameraError::TimedOut.is_timeout());
        assert!(!CameraError::Busy.is_timeout());
        assert!(!CameraError::NotEnoughData.is_timeout());
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        fn read_config() -> Result<(), CameraError> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "crabcapture.toml"))?;
            Ok(())
        }
        let error = read_config().unwrap_err();
        assert!(matches!(error, CameraError::Io(_)));
        assert!(error.source().is_some());
        assert_eq!(
            error,
            CameraError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "other"))
        );
    }

    #[test]
    fn test_equality_compares_payloads() {
        assert_eq!(CameraError::bad_value("x"), CameraError::bad_value("x"));
        assert_ne!(CameraError::bad_value("x"), CameraError::invalid_operation("x"));
        assert_ne!(CameraError::AlreadyActive, CameraError::Busy);
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<CameraError>();
    }
}
