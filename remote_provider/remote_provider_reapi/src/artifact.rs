use std::sync::Arc;

use async_trait::async_trait;
use grpc_util::{create_endpoint, headers_to_http_header_map, layered_service, status_to_str, LayeredService};
use protos::pb::buildstream::artifact_service_client::ArtifactServiceClient;
use protos::pb::buildstream::{
    Artifact, GetArtifactCapabilitiesRequest, GetArtifactRequest, UpdateArtifactRequest,
};
use tonic::Code;

use remote_provider_traits::{IndexProvider, RemoteIndexOptions};

/// The first-party `ArtifactService` implementation of the index half of a remote (§4.6
/// "Artifact-service subinterface", §4.9's `get_artifact`/`update_artifact`).
pub struct Provider {
    instance_name: Option<String>,
    client: Arc<ArtifactServiceClient<LayeredService>>,
}

impl Provider {
    pub async fn new(options: RemoteIndexOptions) -> Result<Provider, String> {
        let rustls_client_config = if options.index_address.starts_with("https://") {
            Some(rustls::ClientConfig::try_from(options.tls_config.clone()).map_err(|e| format!("TLS setup error: {e}"))?)
        } else {
            None
        };

        let mut headers = options.headers.clone();
        let endpoint = create_endpoint(&options.index_address, rustls_client_config.as_ref(), &mut headers)?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|err| format!("failed to connect to artifact server at {}: {err}", options.index_address))?;

        let http_headers = headers_to_http_header_map(&headers)?;
        let channel = layered_service(channel, options.concurrency_limit, http_headers);

        Ok(Provider {
            instance_name: options.instance_name,
            client: Arc::new(ArtifactServiceClient::new(channel)),
        })
    }
}

#[async_trait]
impl IndexProvider for Provider {
    async fn check(&self, require_push: bool) -> Result<(), String> {
        let request = GetArtifactCapabilitiesRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
        };
        let mut client = self.client.as_ref().clone();
        let capabilities = client
            .get_artifact_capabilities(request)
            .await
            .map_err(|status| status_to_str(&status))?
            .into_inner();

        if require_push && !capabilities.allow_updates {
            return Err(format!(
                "artifact server {:?} does not allow updates, but a push was requested",
                self.instance_name
            ));
        }
        Ok(())
    }

    async fn get_artifact(&self, cache_key: &str) -> Result<Option<Artifact>, String> {
        let request = GetArtifactRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            cache_key: cache_key.to_owned(),
        };
        let mut client = self.client.as_ref().clone();
        match client.get_artifact(request).await {
            Ok(response) => Ok(response.into_inner().artifact),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(&status)),
        }
    }

    async fn update_artifact(&self, cache_keys: &[String], artifact: Artifact) -> Result<(), String> {
        let request = UpdateArtifactRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            cache_keys: cache_keys.to_vec(),
            artifact: Some(artifact),
        };
        let mut client = self.client.as_ref().clone();
        client.update_artifact(request).await.map_err(|status| status_to_str(&status))?;
        Ok(())
    }
}
