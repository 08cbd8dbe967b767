use std::sync::Arc;

use async_trait::async_trait;
use grpc_util::{create_endpoint, headers_to_http_header_map, layered_service, status_to_str, LayeredService};
use hashing::Digest;
use protos::pb::build::bazel::remote::asset::v1::{
    fetch_client::FetchClient, push_client::PushClient, FetchBlobRequest, FetchDirectoryRequest,
    PushBlobRequest, PushDirectoryRequest,
};
use tonic::Code;

use remote_provider_traits::{RemoteAssetProvider, RemoteIndexOptions};

/// The REAPI implementation of the Remote Asset subinterface (§4.6), used by the Source Cache
/// (§4.10) to map URNs to directory/blob digests.
pub struct Provider {
    instance_name: Option<String>,
    fetch_client: Arc<FetchClient<LayeredService>>,
    push_client: Arc<PushClient<LayeredService>>,
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
            .map_err(|err| format!("failed to connect to remote asset server at {}: {err}", options.index_address))?;

        let http_headers = headers_to_http_header_map(&headers)?;
        let channel = layered_service(channel, options.concurrency_limit, http_headers);

        Ok(Provider {
            instance_name: options.instance_name,
            fetch_client: Arc::new(FetchClient::new(channel.clone())),
            push_client: Arc::new(PushClient::new(channel)),
        })
    }
}

#[async_trait]
impl RemoteAssetProvider for Provider {
    async fn check(&self, _require_push: bool) -> Result<(), String> {
        // The Remote Asset API has no capability-probe RPC of its own; reachability was already
        // established by `new`'s `connect`.
        Ok(())
    }

    async fn fetch_blob(&self, uri: &str) -> Result<Option<Digest>, String> {
        let request = FetchBlobRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            uris: vec![uri.to_owned()],
            qualifiers: vec![],
        };
        let mut client = self.fetch_client.as_ref().clone();
        match client.fetch_blob(request).await {
            Ok(response) => Ok(Some(hashing::Digest::try_from(
                response.into_inner().blob_digest.as_ref().ok_or("missing blob_digest in FetchBlobResponse")?,
            )?)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(&status)),
        }
    }

    async fn fetch_directory(&self, uri: &str) -> Result<Option<Digest>, String> {
        let request = FetchDirectoryRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            uris: vec![uri.to_owned()],
            qualifiers: vec![],
        };
        let mut client = self.fetch_client.as_ref().clone();
        match client.fetch_directory(request).await {
            Ok(response) => Ok(Some(hashing::Digest::try_from(
                response
                    .into_inner()
                    .root_directory_digest
                    .as_ref()
                    .ok_or("missing root_directory_digest in FetchDirectoryResponse")?,
            )?)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(&status)),
        }
    }

    async fn push_blob(&self, uri: &str, digest: Digest, referenced_blobs: Vec<Digest>) -> Result<(), String> {
        let request = PushBlobRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            uris: vec![uri.to_owned()],
            qualifiers: vec![],
            blob_digest: Some(digest.into()),
            references_blobs: referenced_blobs.into_iter().map(Into::into).collect(),
        };
        let mut client = self.push_client.as_ref().clone();
        client.push_blob(request).await.map_err(|status| status_to_str(&status))?;
        Ok(())
    }

    async fn push_directory(
        &self,
        uri: &str,
        digest: Digest,
        referenced_directories: Vec<Digest>,
    ) -> Result<(), String> {
        let request = PushDirectoryRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            uris: vec![uri.to_owned()],
            qualifiers: vec![],
            root_directory_digest: Some(digest.into()),
            references_directories: referenced_directories.into_iter().map(Into::into).collect(),
        };
        let mut client = self.push_client.as_ref().clone();
        client.push_directory(request).await.map_err(|status| status_to_str(&status))?;
        Ok(())
    }
}
