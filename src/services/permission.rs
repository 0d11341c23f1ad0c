//! Startup permission gate for the location source
//!
//! Runs once before anything subscribes to the position stream. The outcome
//! is terminal for the session - callers never re-poll, and a refusal means
//! the monitor runs without samples.

use crate::domain::{Permission, PermissionStatus};
use crate::io::source::LocationSource;
use tracing::info;

/// Resolve location permission for this session.
///
/// Order matters: a disabled service short-circuits before any permission
/// request is issued. A single request is made when the platform reports the
/// permission as undetermined; whatever it reports after that is final.
pub async fn check_and_request(source: &dyn LocationSource) -> PermissionStatus {
    if !source.is_service_enabled().await {
        info!(source = %source.kind(), "location_service_disabled");
        return PermissionStatus::ServiceDisabled;
    }

    let mut permission = source.permission_status().await;

    if permission == Permission::Undetermined {
        info!(source = %source.kind(), "permission_requested");
        permission = source.request_permission().await;
    }

    let status = match permission {
        Permission::Undetermined | Permission::Denied => PermissionStatus::Denied,
        Permission::DeniedForever => PermissionStatus::DeniedForever,
        Permission::Granted => PermissionStatus::Granted,
    };

    info!(
        source = %source.kind(),
        permission = %permission.as_str(),
        status = %status.as_str(),
        "permission_resolved"
    );

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SubscribeConfig;
    use crate::io::source::Subscription;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted source that records how often a permission request is issued
    struct MockSource {
        service_enabled: bool,
        status: Permission,
        request_result: Permission,
        request_calls: AtomicUsize,
    }

    impl MockSource {
        fn new(service_enabled: bool, status: Permission, request_result: Permission) -> Self {
            Self { service_enabled, status, request_result, request_calls: AtomicUsize::new(0) }
        }

        fn request_count(&self) -> usize {
            self.request_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocationSource for MockSource {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn is_service_enabled(&self) -> bool {
            self.service_enabled
        }

        async fn permission_status(&self) -> Permission {
            self.status
        }

        async fn request_permission(&self) -> Permission {
            self.request_calls.fetch_add(1, Ordering::SeqCst);
            self.request_result
        }

        async fn subscribe(&self, _config: SubscribeConfig) -> anyhow::Result<Subscription> {
            anyhow::bail!("mock source has no stream")
        }
    }

    #[tokio::test]
    async fn test_disabled_service_never_requests() {
        let source = MockSource::new(false, Permission::Undetermined, Permission::Granted);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::ServiceDisabled);
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn test_already_granted_never_requests() {
        let source = MockSource::new(true, Permission::Granted, Permission::Granted);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::Granted);
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn test_undetermined_then_granted() {
        let source = MockSource::new(true, Permission::Undetermined, Permission::Granted);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::Granted);
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn test_undetermined_then_denied() {
        let source = MockSource::new(true, Permission::Undetermined, Permission::Denied);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::Denied);
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn test_still_undetermined_after_request_is_denied() {
        let source = MockSource::new(true, Permission::Undetermined, Permission::Undetermined);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::Denied);
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn test_request_can_end_permanently_refused() {
        let source = MockSource::new(true, Permission::Undetermined, Permission::DeniedForever);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::DeniedForever);
    }

    #[tokio::test]
    async fn test_permanently_refused_without_request() {
        let source = MockSource::new(true, Permission::DeniedForever, Permission::Granted);

        let status = check_and_request(&source).await;

        assert_eq!(status, PermissionStatus::DeniedForever);
        assert_eq!(source.request_count(), 0);
    }
}
