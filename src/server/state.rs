use crate::postal::PostalResolver;
use std::sync::Arc;

pub struct AppState {
    pub resolver: Arc<PostalResolver>,
}
