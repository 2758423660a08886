use log::debug;
use paygate::{
    monerod_client::Client as MonerodClient, parse_spend_key, parse_view_key, storage::Storage,
    PaymentProcessor, XmrKeys,
};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use super::{
    to_status,
    v1::{
        user_service_server::UserService, GetCryptoKeysRequest, GetCryptoKeysResponse,
        RegisterUserRequest, RegisterUserResponse, UpdateCryptoKeysRequest,
        UpdateCryptoKeysResponse, XmrKeys as PbXmrKeys,
    },
};

/// `UserService` backed by a [`PaymentProcessor`].
pub struct UserApi<S: Storage, M: MonerodClient> {
    processor: PaymentProcessor<S, M>,
}

impl<S: Storage, M: MonerodClient> UserApi<S, M> {
    /// Create the service.
    pub fn new(processor: PaymentProcessor<S, M>) -> UserApi<S, M> {
        UserApi { processor }
    }

    async fn require_user(&self, raw_id: &str) -> Result<Uuid, Status> {
        let user_id = Uuid::parse_str(raw_id)
            .map_err(|_| Status::invalid_argument("invalid userId (uuid)"))?;
        let exists = self
            .processor
            .user_exists(user_id)
            .await
            .map_err(to_status)?;
        if !exists {
            return Err(Status::invalid_argument("user does not exist"));
        }
        Ok(user_id)
    }
}

#[tonic::async_trait]
impl<S: Storage, M: MonerodClient> UserService for UserApi<S, M> {
    async fn register_user(
        &self,
        request: Request<RegisterUserRequest>,
    ) -> Result<Response<RegisterUserResponse>, Status> {
        let request = request.into_inner();
        let user_id = request
            .user_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| Status::invalid_argument("invalid userId (uuid)"))?;

        let created = self
            .processor
            .register_user(user_id)
            .await
            .map_err(to_status)?;
        debug!("Registered user {created}");

        Ok(Response::new(RegisterUserResponse {
            user_id: created.to_string(),
        }))
    }

    async fn update_crypto_keys(
        &self,
        request: Request<UpdateCryptoKeysRequest>,
    ) -> Result<Response<UpdateCryptoKeysResponse>, Status> {
        let request = request.into_inner();
        let user_id = self.require_user(&request.user_id).await?;

        if let Some(xmr) = request.xmr_req {
            parse_view_key(&xmr.priv_view_key)
                .map_err(|_| Status::invalid_argument("invalid private view key"))?;
            parse_spend_key(&xmr.pub_spend_key)
                .map_err(|_| Status::invalid_argument("invalid public spend key"))?;

            self.processor
                .update_crypto_keys(
                    user_id,
                    XmrKeys {
                        priv_view_key: xmr.priv_view_key,
                        pub_spend_key: xmr.pub_spend_key,
                    },
                )
                .await
                .map_err(to_status)?;
            debug!("Updated XMR keys for user {user_id}");
        }

        Ok(Response::new(UpdateCryptoKeysResponse {}))
    }

    async fn get_crypto_keys(
        &self,
        request: Request<GetCryptoKeysRequest>,
    ) -> Result<Response<GetCryptoKeysResponse>, Status> {
        let request = request.into_inner();
        let user_id = self.require_user(&request.user_id).await?;

        let keys = self
            .processor
            .get_crypto_keys(user_id)
            .await
            .map_err(to_status)?;

        Ok(Response::new(GetCryptoKeysResponse {
            xmr_keys: Some(PbXmrKeys {
                priv_view_key: keys.priv_view_key,
                pub_spend_key: keys.pub_spend_key,
            }),
        }))
    }
}
