use serde::Serialize;

/// Response envelope, grounded on the teacher's `utils::response::ApiResponse` (its `ts-rs`
/// TypeScript-binding derive is dropped here - this crate has no paired TypeScript frontend to
/// bind against).
#[derive(Debug, Serialize)]
pub struct ApiResponse<T, E = T> {
    success: bool,
    data: Option<T>,
    error_data: Option<E>,
    message: Option<String>,
}

impl<T, E> ApiResponse<T, E> {
    pub fn success(data: T) -> Self {
        ApiResponse { success: true, data: Some(data), message: None, error_data: None }
    }

    pub fn error(message: &str) -> Self {
        ApiResponse { success: false, data: None, message: Some(message.to_string()), error_data: None }
    }

    pub fn into_data(self) -> T {
        self.data.expect("ApiResponse::into_data called on an error response")
    }
}
