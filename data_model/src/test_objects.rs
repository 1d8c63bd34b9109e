pub mod tests {
    use crate::{BUILD_STATUS_SUCCESS, BuildCompletionEvent, BuildCompletionEventBuilder};

    pub const TEST_TENANT_ID: &str = "customer-123";
    pub const TEST_FUNCTION_ID: &str = "parser-abc";
    pub const TEST_IMAGE_V1: &str = "registry/x:customer-123-parser-abc";
    pub const TEST_IMAGE_V2: &str = "registry/x:customer-123-parser-abc-v2";

    pub fn mock_build_event(image_reference: &str) -> BuildCompletionEvent {
        mock_build_event_for(TEST_TENANT_ID, TEST_FUNCTION_ID, image_reference)
    }

    pub fn mock_build_event_for(
        tenant_id: &str,
        function_id: &str,
        image_reference: &str,
    ) -> BuildCompletionEvent {
        BuildCompletionEventBuilder::default()
            .tenant_id(tenant_id)
            .function_id(function_id)
            .image_reference(image_reference)
            .status(BUILD_STATUS_SUCCESS)
            .correlation_id(format!("{tenant_id}-{function_id}"))
            .build()
            .unwrap()
    }

    pub fn mock_failed_build_event() -> BuildCompletionEvent {
        BuildCompletionEventBuilder::default()
            .tenant_id(TEST_TENANT_ID)
            .function_id(TEST_FUNCTION_ID)
            .image_reference("")
            .status("failed")
            .error_message("compilation failed")
            .build()
            .unwrap()
    }
}
