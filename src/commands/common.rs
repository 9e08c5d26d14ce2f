use anyhow::Result;

use crate::ipc::IpcResponse;

pub(crate) fn expect_ok(response: IpcResponse) -> Result<IpcResponse> {
    if response.ok {
        Ok(response)
    } else if let Some(kind) = response.error_kind {
        anyhow::bail!("{} [{kind}]", response.message)
    } else {
        anyhow::bail!(response.message)
    }
}

pub(crate) fn pid_cell(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::{expect_ok, pid_cell};
    use crate::errors::ServiceError;
    use crate::ipc::IpcResponse;

    #[test]
    fn expect_ok_returns_response_when_ok() {
        let response = IpcResponse::ok("all good");

        let result = expect_ok(response.clone()).expect("expected successful response");

        assert!(result.ok);
        assert_eq!(result.message, "all good");
    }

    #[test]
    fn expect_ok_returns_message_as_error_when_response_failed() {
        let err = expect_ok(IpcResponse::error("daemon unavailable"))
            .expect_err("expected failed response to become an error");

        assert_eq!(err.to_string(), "daemon unavailable");
    }

    #[test]
    fn expect_ok_appends_error_kind_for_service_errors() {
        let response =
            IpcResponse::service_error(&ServiceError::SelfStopForbidden("admin".to_string()));

        let err = expect_ok(response).expect_err("expected failed response to become an error");

        let rendered = err.to_string();
        assert!(rendered.ends_with("[self_stop_forbidden]"), "got {rendered}");
        assert!(rendered.contains("admin"), "got {rendered}");
    }

    #[test]
    fn pid_cell_renders_dash_for_missing_pid() {
        assert_eq!(pid_cell(None), "-");
        assert_eq!(pid_cell(Some(4242)), "4242");
    }
}
