#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::iter::FromIterator;
use std::str::FromStr;

use http::header::{HeaderName, USER_AGENT};
use http::{HeaderMap, HeaderValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tower::limit::ConcurrencyLimit;
use tower::ServiceBuilder;

use crate::headers::{SetRequestHeaders, SetRequestHeadersLayer};

pub mod headers;
pub mod tls;
pub mod uds;

// NB: rather than boxing our tower/tonic services, we define a type alias that fully describes
// the Service layers that are used universally across the daemon channel and every remote
// channel. If this type becomes unwieldy, or the various channels diverge in which layers they
// use, switch to a `Box<dyn Service<..>>`.
pub type LayeredService = SetRequestHeaders<ConcurrencyLimit<Channel>>;

pub fn layered_service(
    channel: Channel,
    concurrency_limit: usize,
    http_headers: HeaderMap,
) -> LayeredService {
    ServiceBuilder::new()
        .layer(SetRequestHeadersLayer::new(http_headers))
        .concurrency_limit(concurrency_limit)
        .service(channel)
}

/// Creates a Tonic `Endpoint` from a string containing a schema and IP address/name, optionally
/// configured for TLS.
pub fn create_endpoint(
    addr: &str,
    tls_config_opt: Option<&rustls::ClientConfig>,
    headers: &mut BTreeMap<String, String>,
) -> Result<Endpoint, String> {
    let uri =
        tonic::transport::Uri::try_from(addr).map_err(|err| format!("invalid address: {err}"))?;
    let endpoint = Channel::builder(uri);

    let endpoint = if let Some(tls_config) = tls_config_opt {
        endpoint
            .tls_config(ClientTlsConfig::new().rustls_client_config(tls_config.clone()))
            .map_err(|e| format!("TLS setup error: {e}"))?
    } else {
        endpoint
    };

    let endpoint = match headers.entry(USER_AGENT.as_str().to_owned()) {
        Entry::Occupied(e) => {
            let (_, user_agent) = e.remove_entry();
            endpoint
                .user_agent(user_agent)
                .map_err(|e| format!("Unable to convert user-agent header: {e}"))?
        }
        Entry::Vacant(_) => endpoint,
    };

    Ok(endpoint)
}

pub fn headers_to_http_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut http_headers = Vec::with_capacity(headers.len());
    for (key, value) in headers {
        let header_name =
            HeaderName::from_str(key).map_err(|err| format!("Invalid header name {key}: {err}"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| format!("Invalid header value {value}: {err}"))?;
        http_headers.push((header_name, header_value));
    }
    Ok(HeaderMap::from_iter(http_headers))
}

pub fn status_to_str(status: &tonic::Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    #[test]
    fn headers_to_http_header_map_rejects_invalid_names() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_owned(), "value".to_owned());
        assert!(super::headers_to_http_header_map(&headers).is_err());
    }

    #[test]
    fn headers_to_http_header_map_round_trips_valid_entries() {
        let mut headers = BTreeMap::new();
        headers.insert("x-instance-name".to_owned(), "main".to_owned());
        let map = super::headers_to_http_header_map(&headers).unwrap();
        assert_eq!(map.get("x-instance-name").unwrap(), "main");
    }
}
