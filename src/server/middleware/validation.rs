use crate::server::message::ClientFrame;
use crate::server::message::MessageError;

/// Upper bound on inbound chat content, in bytes.
const MAX_CONTENT_BYTES: usize = 4096;

/// Validates an inbound client frame to ensure it meets size constraints.
///
/// # Returns
///
/// * `Ok(())` if the frame is within allowed limits.
/// * `Err(MessageError::MessageTooLong)` if the content exceeds the limit.
pub fn validate_frame(frame: &ClientFrame) -> Result<(), MessageError> {
    if frame.content.len() > MAX_CONTENT_BYTES {
        return Err(MessageError::MessageTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_content() {
        let frame = ClientFrame {
            content: "hello".into(),
            reply_to: None,
            agent_id: None,
        };
        assert!(validate_frame(&frame).is_ok());
    }

    #[test]
    fn rejects_oversized_content() {
        let frame = ClientFrame {
            content: "x".repeat(MAX_CONTENT_BYTES + 1),
            reply_to: None,
            agent_id: None,
        };
        assert!(matches!(
            validate_frame(&frame),
            Err(MessageError::MessageTooLong)
        ));
    }
}
