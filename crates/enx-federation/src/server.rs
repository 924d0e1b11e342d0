//! The federation-out `Fetch` handler.
//!
//! One call streams primary keys, then revised keys, newest-window-bounded
//! and capped. Interruption by deadline or cap produces a partial response
//! whose continuation state resumes exactly where the stream stopped;
//! callers echo `next_fetch_state` verbatim on the next call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument};

use enx_auth::oidc::IdTokenValidator;
use enx_core::{Cursor, FederationOutAuthorization, normalize_regions, truncate_window};
use enx_storage::{
    ExposureStore, FederationAuthorizationStore, IterateCriteria, StorageError, Visit,
};

use crate::auth::PeerAuthenticator;
use crate::config::FederationConfig;
use crate::proto;
use crate::proto::federation_server::Federation;
use crate::transform;

/// The federation-out gRPC service.
pub struct FederationOutService {
    exposures: Arc<dyn ExposureStore>,
    authenticator: PeerAuthenticator,
    config: FederationConfig,
}

impl FederationOutService {
    /// Creates the service over the given stores and ID-token validator.
    #[must_use]
    pub fn new(
        exposures: Arc<dyn ExposureStore>,
        authorizations: Arc<dyn FederationAuthorizationStore>,
        validator: Arc<dyn IdTokenValidator>,
        config: FederationConfig,
    ) -> Self {
        let authenticator =
            PeerAuthenticator::new(validator, authorizations, config.auth_cache_ttl);
        Self {
            exposures,
            authenticator,
            config,
        }
    }

    /// The fetch deadline: the configured timeout, shortened by the
    /// caller's RPC deadline when one is present.
    fn deadline(&self, metadata: &MetadataMap) -> Instant {
        let timeout = grpc_timeout(metadata)
            .map_or(self.config.fetch_timeout, |t| {
                t.min(self.config.fetch_timeout)
            });
        Instant::now() + timeout
    }

    #[instrument(skip_all, fields(issuer = %authorization.issuer, subject = %authorization.subject))]
    async fn fetch_scoped(
        &self,
        authorization: &FederationOutAuthorization,
        request: proto::FederationFetchRequest,
        deadline: Instant,
    ) -> Result<proto::FederationFetchResponse, Status> {
        let include = normalize_regions(&request.include_regions);
        let exclude = normalize_regions(&request.exclude_regions);
        if include.iter().any(|region| exclude.contains(region)) {
            return Err(Status::invalid_argument(
                "regions cannot be both included and excluded",
            ));
        }

        let state = request.state.clone().unwrap_or_default();
        let mut key_cursor = core_cursor(state.key_cursor.clone());
        let mut revised_cursor = core_cursor(state.revised_key_cursor.clone());

        // The caller's request scoped to its authorization envelope.
        let effective_exclude = union_regions(&exclude, &authorization.exclude_regions);
        let effective_include =
            match intersect_includes(&include, &authorization.include_regions) {
                IncludeScope::Unconstrained => Vec::new(),
                IncludeScope::Regions(regions) if regions.is_empty() => {
                    // The caller asked only for regions it is not authorized
                    // to receive; there is nothing to stream.
                    debug!("region envelope is empty");
                    return Ok(proto::FederationFetchResponse {
                        keys: vec![],
                        revised_keys: vec![],
                        partial_response: false,
                        next_fetch_state: Some(state),
                    });
                }
                IncludeScope::Regions(regions) => regions,
            };

        let max_records = if request.max_exposure_keys > 0 {
            request.max_exposure_keys.min(self.config.max_records)
        } else {
            self.config.max_records
        } as usize;

        let now = OffsetDateTime::now_utc();
        // Only the most recent complete window is served; keys landing in
        // the open window would race publishers.
        let fetch_until = truncate_window(now, self.config.truncate_window);

        let mut keys: Vec<proto::ExposureKey> = Vec::new();
        let mut revised_keys: Vec<proto::ExposureKey> = Vec::new();
        let mut partial = false;

        // Primary class.
        {
            let criteria = IterateCriteria {
                include_regions: effective_include.clone(),
                exclude_regions: effective_exclude.clone(),
                since: Some(unix(key_cursor.timestamp)?),
                until: Some(fetch_until),
                last_cursor: key_cursor.next_token.clone(),
                only_revised: false,
                only_travelers: request.only_travelers,
                only_local_provenance: request.only_local_provenance,
            };
            let token = self
                .exposures
                .iterate(&criteria, &mut |exposure| {
                    if Instant::now() >= deadline || keys.len() >= max_records {
                        return Visit::StopBefore;
                    }
                    let created = exposure.created_at.unix_timestamp();
                    if let Some(key) =
                        transform::primary(&exposure, &effective_include, &effective_exclude)
                    {
                        keys.push(key);
                    }
                    key_cursor.advance_to(created);
                    Visit::Continue
                })
                .await
                .map_err(internal_status)?;

            if token.is_empty() {
                key_cursor.next_token.clear();
                if !keys.is_empty() && fetch_until.unix_timestamp() > key_cursor.timestamp {
                    // Completed page: step past the boundary second so the
                    // next call cannot re-observe the last record.
                    key_cursor.timestamp += 1;
                }
            } else {
                key_cursor.next_token = token;
                partial = true;
            }
        }

        // Revised class, unless the primary stream was cut short or the cap
        // is already spent.
        if !partial && keys.len() < max_records {
            let criteria = IterateCriteria {
                include_regions: effective_include.clone(),
                exclude_regions: effective_exclude.clone(),
                since: Some(unix(revised_cursor.timestamp)?),
                until: Some(fetch_until),
                last_cursor: revised_cursor.next_token.clone(),
                only_revised: true,
                only_travelers: request.only_travelers,
                only_local_provenance: request.only_local_provenance,
            };
            let token = self
                .exposures
                .iterate(&criteria, &mut |exposure| {
                    if Instant::now() >= deadline || keys.len() + revised_keys.len() >= max_records
                    {
                        return Visit::StopBefore;
                    }
                    let revised_at = exposure
                        .revised_at
                        .map_or(i64::MIN, |t| t.unix_timestamp());
                    if let Some(key) =
                        transform::revised(&exposure, &effective_include, &effective_exclude)
                    {
                        revised_keys.push(key);
                    }
                    revised_cursor.advance_to(revised_at);
                    Visit::Continue
                })
                .await
                .map_err(internal_status)?;

            if token.is_empty() {
                revised_cursor.next_token.clear();
                if !revised_keys.is_empty()
                    && fetch_until.unix_timestamp() > revised_cursor.timestamp
                {
                    revised_cursor.timestamp += 1;
                }
            } else {
                revised_cursor.next_token = token;
                partial = true;
            }
        }

        info!(
            keys = keys.len(),
            revised_keys = revised_keys.len(),
            partial,
            "fetch complete"
        );
        Ok(proto::FederationFetchResponse {
            keys,
            revised_keys,
            partial_response: partial,
            next_fetch_state: Some(proto::FetchState {
                key_cursor: Some(proto_cursor(key_cursor)),
                revised_key_cursor: Some(proto_cursor(revised_cursor)),
            }),
        })
    }
}

#[tonic::async_trait]
impl Federation for FederationOutService {
    async fn fetch(
        &self,
        request: Request<proto::FederationFetchRequest>,
    ) -> Result<Response<proto::FederationFetchResponse>, Status> {
        let deadline = self.deadline(request.metadata());
        let authorization = self.authenticator.authenticate(request.metadata()).await?;
        let response = self
            .fetch_scoped(&authorization, request.into_inner(), deadline)
            .await?;
        Ok(Response::new(response))
    }
}

enum IncludeScope {
    /// Neither side constrains regions.
    Unconstrained,
    Regions(Vec<String>),
}

/// Intersects the caller's requested include regions with its authorized
/// ones. An empty set on one side defers to the other.
fn intersect_includes(
    requested: &[String],
    authorized: &std::collections::BTreeSet<String>,
) -> IncludeScope {
    match (requested.is_empty(), authorized.is_empty()) {
        (true, true) => IncludeScope::Unconstrained,
        (true, false) => IncludeScope::Regions(authorized.iter().cloned().collect()),
        (false, true) => IncludeScope::Regions(requested.to_vec()),
        (false, false) => IncludeScope::Regions(
            requested
                .iter()
                .filter(|region| authorized.contains(*region))
                .cloned()
                .collect(),
        ),
    }
}

fn union_regions(
    requested: &[String],
    authorized: &std::collections::BTreeSet<String>,
) -> Vec<String> {
    let mut out: Vec<String> = requested.to_vec();
    out.extend(authorized.iter().cloned());
    out.sort();
    out.dedup();
    out
}

fn core_cursor(cursor: Option<proto::Cursor>) -> Cursor {
    cursor
        .map(|c| Cursor {
            timestamp: c.timestamp,
            next_token: c.next_token,
        })
        .unwrap_or_default()
}

fn proto_cursor(cursor: Cursor) -> proto::Cursor {
    proto::Cursor {
        timestamp: cursor.timestamp,
        next_token: cursor.next_token,
    }
}

fn unix(timestamp: i64) -> Result<OffsetDateTime, Status> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .map_err(|_| Status::invalid_argument("cursor timestamp out of range"))
}

fn internal_status(err: StorageError) -> Status {
    error!(error = %err, "exposure iteration failed");
    Status::internal("internal error")
}

/// Parses the caller's `grpc-timeout` metadata (e.g. `5S`, `100m`).
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use enx_auth::oidc::{IdTokenClaims, OidcError};
    use enx_core::Exposure;
    use enx_storage::memory::{MemoryExposureStore, MemoryFederationAuthorizationStore};

    const GOOD_TOKEN: &str = "good-token";

    struct StaticValidator {
        claims: IdTokenClaims,
    }

    #[async_trait]
    impl IdTokenValidator for StaticValidator {
        async fn validate(&self, token: &str) -> Result<IdTokenClaims, OidcError> {
            if token == GOOD_TOKEN {
                Ok(self.claims.clone())
            } else {
                Err(OidcError::Invalid("unknown token".to_string()))
            }
        }
    }

    struct Fixture {
        exposures: Arc<MemoryExposureStore>,
        service: FederationOutService,
    }

    async fn fixture(authorization: FederationOutAuthorization, config: FederationConfig) -> Fixture {
        let exposures = Arc::new(MemoryExposureStore::new());
        let authorizations = Arc::new(MemoryFederationAuthorizationStore::new());
        authorizations.upsert(&authorization).await.unwrap();

        let validator = Arc::new(StaticValidator {
            claims: IdTokenClaims {
                issuer: authorization.issuer.clone(),
                subject: authorization.subject.clone(),
                audiences: vec!["exposure-federation".to_string()],
            },
        });

        let service = FederationOutService::new(
            Arc::clone(&exposures) as Arc<dyn ExposureStore>,
            authorizations,
            validator,
            config,
        );
        Fixture { exposures, service }
    }

    fn open_authorization() -> FederationOutAuthorization {
        FederationOutAuthorization {
            issuer: "https://peer.example".to_string(),
            subject: "fed-client".to_string(),
            audience: None,
            include_regions: Default::default(),
            exclude_regions: Default::default(),
            note: String::new(),
        }
    }

    fn exposure(created: i64, regions: &[&str]) -> Exposure {
        Exposure {
            id: 0,
            exposure_key: vec![7u8; enx_core::KEY_LENGTH],
            transmission_risk: 2,
            regions: regions.iter().map(|r| r.to_string()).collect(),
            interval_number: 1000,
            interval_count: 144,
            created_at: OffsetDateTime::from_unix_timestamp(created).unwrap(),
            local_provenance: true,
            traveler: false,
            report_type: "confirmed".to_string(),
            days_since_symptom_onset: Some(1),
            revised_report_type: None,
            revised_at: None,
            revised_transmission_risk: None,
            revised_days_since_symptom_onset: None,
        }
    }

    fn authorized(request: proto::FederationFetchRequest) -> Request<proto::FederationFetchRequest> {
        let mut request = Request::new(request);
        request.metadata_mut().insert(
            "authorization",
            format!("Bearer {GOOD_TOKEN}").parse().unwrap(),
        );
        request
    }

    #[tokio::test]
    async fn test_missing_or_bad_authorization() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;

        let status = fixture
            .service
            .fetch(Request::new(proto::FederationFetchRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let mut request = Request::new(proto::FederationFetchRequest::default());
        request
            .metadata_mut()
            .insert("authorization", "Bearer forged".parse().unwrap());
        let status = fixture.service.fetch(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unauthenticated() {
        // The validator accepts the token, but no authorization row exists
        // for the (issuer, subject) pair.
        let exposures = Arc::new(MemoryExposureStore::new());
        let authorizations = Arc::new(MemoryFederationAuthorizationStore::new());
        let validator = Arc::new(StaticValidator {
            claims: IdTokenClaims {
                issuer: "https://peer.example".to_string(),
                subject: "stranger".to_string(),
                audiences: vec![],
            },
        });
        let service = FederationOutService::new(
            exposures,
            authorizations,
            validator,
            FederationConfig::default(),
        );

        let status = service
            .fetch(authorized(proto::FederationFetchRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_pinned_audience_must_match() {
        let mut authorization = open_authorization();
        authorization.audience = Some("some-other-audience".to_string());
        let fixture = fixture(authorization, FederationConfig::default()).await;

        let status = fixture
            .service
            .fetch(authorized(proto::FederationFetchRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_include_exclude_overlap_is_invalid() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;

        let request = proto::FederationFetchRequest {
            include_regions: vec!["US".to_string()],
            exclude_regions: vec!["us".to_string()],
            ..Default::default()
        };
        let status = fixture.service.fetch(authorized(request)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_region_scoping() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;
        fixture
            .exposures
            .insert(&exposure(100, &["US", "CH", "MX"]))
            .await
            .unwrap();
        fixture
            .exposures
            .insert(&exposure(200, &["CH"]))
            .await
            .unwrap();

        let request = proto::FederationFetchRequest {
            include_regions: vec!["US".to_string()],
            exclude_regions: vec!["CH".to_string()],
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.keys.len(), 1);
        assert_eq!(response.keys[0].regions, vec!["US"]);
        assert!(!response.partial_response);
    }

    #[tokio::test]
    async fn test_authorization_envelope_bounds_request() {
        let mut authorization = open_authorization();
        authorization.include_regions = ["US".to_string(), "CA".to_string()].into_iter().collect();
        authorization.exclude_regions = ["MX".to_string()].into_iter().collect();
        let fixture = fixture(authorization, FederationConfig::default()).await;

        fixture
            .exposures
            .insert(&exposure(100, &["US", "CH", "MX"]))
            .await
            .unwrap();

        // The caller asks for more than it is allowed; the envelope wins.
        let request = proto::FederationFetchRequest {
            include_regions: vec!["US".to_string(), "CH".to_string()],
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.keys.len(), 1);
        assert_eq!(response.keys[0].regions, vec!["US"]);
    }

    #[tokio::test]
    async fn test_empty_region_envelope_short_circuits() {
        let mut authorization = open_authorization();
        authorization.include_regions = ["CA".to_string()].into_iter().collect();
        let fixture = fixture(authorization, FederationConfig::default()).await;
        fixture
            .exposures
            .insert(&exposure(100, &["US"]))
            .await
            .unwrap();

        let request = proto::FederationFetchRequest {
            include_regions: vec!["US".to_string()],
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();
        assert!(response.keys.is_empty());
        assert!(!response.partial_response);
    }

    #[tokio::test]
    async fn test_partial_then_resume_with_boundary_bump() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;
        for created in [100, 200, 300] {
            fixture
                .exposures
                .insert(&exposure(created, &["US"]))
                .await
                .unwrap();
        }

        // First page: the cap cuts the stream after two keys.
        let request = proto::FederationFetchRequest {
            max_exposure_keys: 2,
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.keys.len(), 2);
        assert!(response.partial_response);
        let state = response.next_fetch_state.unwrap();
        let cursor = state.key_cursor.clone().unwrap();
        assert_eq!(cursor.timestamp, 200);
        assert!(!cursor.next_token.is_empty());

        // Second page: echo the state verbatim; the stream resumes past the
        // boundary record and the completed page bumps the cursor.
        let request = proto::FederationFetchRequest {
            max_exposure_keys: 2,
            state: Some(state),
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.keys.len(), 1);
        assert_eq!(
            response.keys[0].interval_number, 1000,
            "third key is emitted exactly once"
        );
        assert!(!response.partial_response);
        let cursor = response
            .next_fetch_state
            .unwrap()
            .key_cursor
            .unwrap();
        assert_eq!(cursor.timestamp, 301);
        assert!(cursor.next_token.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_produces_partial_response() {
        let config = FederationConfig::default().with_fetch_timeout(Duration::from_millis(50));
        let fixture = fixture(open_authorization(), config).await;
        let first = fixture
            .exposures
            .insert(&exposure(100, &["US"]))
            .await
            .unwrap();
        fixture
            .exposures
            .insert(&exposure(200, &["US"]))
            .await
            .unwrap();
        // The second row arrives only after the deadline has passed.
        fixture
            .exposures
            .delay_before(first + 1, Duration::from_millis(120))
            .await;

        let response = fixture
            .service
            .fetch(authorized(proto::FederationFetchRequest::default()))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.keys.len(), 1);
        assert!(response.partial_response);
        let cursor = response
            .next_fetch_state
            .unwrap()
            .key_cursor
            .unwrap();
        assert_eq!(cursor.timestamp, 100);
        assert!(!cursor.next_token.is_empty());
    }

    #[tokio::test]
    async fn test_revised_keys_stream_after_primary() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;
        fixture
            .exposures
            .insert(&exposure(100, &["US"]))
            .await
            .unwrap();

        let mut revised = exposure(150, &["US"]);
        revised.revised_report_type = Some("negative".to_string());
        revised.revised_at = Some(OffsetDateTime::from_unix_timestamp(400).unwrap());
        revised.revised_transmission_risk = Some(0);
        fixture.exposures.insert(&revised).await.unwrap();

        let response = fixture
            .service
            .fetch(authorized(proto::FederationFetchRequest::default()))
            .await
            .unwrap()
            .into_inner();

        // The revised exposure appears in both classes: as a primary key by
        // creation time and as a revised key by revision time.
        assert_eq!(response.keys.len(), 2);
        assert_eq!(response.revised_keys.len(), 1);
        assert_eq!(
            response.revised_keys[0].report_type,
            proto::ReportType::Revoked as i32
        );
        assert!(!response.partial_response);

        let state = response.next_fetch_state.unwrap();
        assert_eq!(state.key_cursor.unwrap().timestamp, 151);
        assert_eq!(state.revised_key_cursor.unwrap().timestamp, 401);
    }

    #[tokio::test]
    async fn test_traveler_filter() {
        let fixture = fixture(open_authorization(), FederationConfig::default()).await;
        let mut traveler = exposure(100, &["US"]);
        traveler.traveler = true;
        fixture.exposures.insert(&traveler).await.unwrap();
        fixture
            .exposures
            .insert(&exposure(200, &["US"]))
            .await
            .unwrap();

        let request = proto::FederationFetchRequest {
            only_travelers: true,
            ..Default::default()
        };
        let response = fixture
            .service
            .fetch(authorized(request))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.keys.len(), 1);
        assert!(response.keys[0].traveler);
    }

    #[test]
    fn test_grpc_timeout_parsing() {
        let mut metadata = MetadataMap::new();
        assert!(grpc_timeout(&metadata).is_none());

        metadata.insert("grpc-timeout", "5S".parse().unwrap());
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_secs(5)));

        metadata.insert("grpc-timeout", "250m".parse().unwrap());
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_millis(250)));

        metadata.insert("grpc-timeout", "2M".parse().unwrap());
        assert_eq!(grpc_timeout(&metadata), Some(Duration::from_secs(120)));

        metadata.insert("grpc-timeout", "bogus".parse().unwrap());
        assert_eq!(grpc_timeout(&metadata), None);
    }

    #[test]
    fn test_cursor_conversion_roundtrip() {
        let cursor = Cursor {
            timestamp: 42,
            next_token: "tok".to_string(),
        };
        let roundtripped = core_cursor(Some(proto_cursor(cursor.clone())));
        assert_eq!(roundtripped, cursor);
        assert_eq!(core_cursor(None), Cursor::default());
    }
}
