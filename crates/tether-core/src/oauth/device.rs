//! Device-flow authorization polling.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::{ProviderRequirement, StoredToken};
use crate::remote::{DeviceAuthorization, DevicePoll, HubError, TokenBroker};

/// Extra seconds added to the poll interval on a `slow_down` response.
const SLOW_DOWN_INCREMENT_SECONDS: i64 = 5;

#[derive(Debug, Error)]
pub enum DeviceFlowError {
    #[error("The user denied the authorization request")]
    AccessDenied,
    #[error("The device code expired before the user authorized")]
    Expired,
    #[error("Authorization did not complete within the provider's window")]
    Timeout,
    #[error("Device authorization was aborted")]
    Aborted,
    #[error(transparent)]
    Hub(#[from] HubError),
}

pub type DeviceFlowResult<T> = Result<T, DeviceFlowError>;

/// Run the device authorization flow for one provider.
///
/// Displays the user code via `on_user_code`, then polls the broker until
/// the grant arrives, the provider window elapses, or `abort` fires. The
/// abort flag is checked on every iteration and again after every sleep.
pub async fn run_device_flow<B>(
    broker: &B,
    requirement: &ProviderRequirement,
    abort: &CancellationToken,
    on_user_code: impl FnOnce(&DeviceAuthorization) + Send,
) -> DeviceFlowResult<StoredToken>
where
    B: TokenBroker + ?Sized,
{
    let authorization = broker
        .start_device_authorization(&requirement.provider_id, &requirement.scopes)
        .await?;
    on_user_code(&authorization);

    let deadline =
        Instant::now() + Duration::from_secs(u64::try_from(authorization.expires_in).unwrap_or(0));
    let mut interval = authorization.interval.max(1);

    loop {
        if abort.is_cancelled() {
            return Err(DeviceFlowError::Aborted);
        }

        tokio::select! {
            () = abort.cancelled() => return Err(DeviceFlowError::Aborted),
            () = sleep(Duration::from_secs(u64::try_from(interval).unwrap_or(1))) => {}
        }

        if abort.is_cancelled() {
            return Err(DeviceFlowError::Aborted);
        }
        if Instant::now() >= deadline {
            return Err(DeviceFlowError::Timeout);
        }

        match broker
            .poll_device_token(&requirement.provider_id, &authorization.device_code)
            .await?
        {
            DevicePoll::Pending => {}
            DevicePoll::SlowDown => {
                interval += SLOW_DOWN_INCREMENT_SECONDS;
                tracing::debug!(
                    provider_id = %requirement.provider_id,
                    interval,
                    "provider asked to slow down device polling"
                );
            }
            DevicePoll::AccessDenied => return Err(DeviceFlowError::AccessDenied),
            DevicePoll::Expired => return Err(DeviceFlowError::Expired),
            DevicePoll::Granted(grant) => {
                return Ok(grant.into_stored(&requirement.provider_id, &requirement.scopes));
            }
        }
    }
}
