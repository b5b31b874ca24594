//! tonic server implementation wrapping a `store::ProfileStore`.
//! `ReadRange` streams results back in frames capped at
//! `MAX_BYTES_PER_FRAME`, matching the `maxBytesPerFrame` soft cap the
//! original's gRPC store server uses so one huge range query doesn't
//! produce a single multi-hundred-MB response message.

use std::pin::Pin;
use std::sync::Arc;

use store::{ProfileKey, ProfileStore, RangeKey, VisitResult};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

pub mod pb {
    tonic::include_proto!("store.v1");
}

use pb::store_server::{Store, StoreServer};
use pb::{ProfileRecord, ReadRangeRequest, ReadRangeResponse, WriteRequest, WriteResponse};

const MAX_BYTES_PER_FRAME: usize = 2 * 1024 * 1024;

pub struct StoreService {
    store: Arc<dyn ProfileStore>,
}

impl StoreService {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    pub fn into_server(self) -> StoreServer<Self> {
        StoreServer::new(self)
    }
}

#[tonic::async_trait]
impl Store for StoreService {
    async fn write(&self, request: Request<WriteRequest>) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let key = ProfileKey::new(req.timestamp_unix_ms, req.job, req.profile_type, req.instance).encode();
        self.store
            .put(&key, &req.raw_profile)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(WriteResponse {}))
    }

    type ReadRangeStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<ReadRangeResponse, Status>> + Send>>;

    async fn read_range(
        &self,
        request: Request<ReadRangeRequest>,
    ) -> Result<Response<Self::ReadRangeStream>, Status> {
        let req = request.into_inner();
        if req.to_unix_ms < req.from_unix_ms {
            return Err(Status::invalid_argument("to must not be before from"));
        }

        let lo = RangeKey { ts: req.from_unix_ms, ..Default::default() }.encode_prefix();
        let hi = RangeKey { ts: req.to_unix_ms, ..Default::default() }.encode_prefix();

        let (tx, rx) = mpsc::channel(8);
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || {
            let mut frame: Vec<ProfileRecord> = Vec::new();
            let mut frame_bytes = 0usize;

            let result = store.scan(&lo, &hi, &mut |k, v| {
                if tx.is_closed() {
                    return VisitResult::Stop;
                }
                let Ok(key) = ProfileKey::decode(k) else {
                    return VisitResult::Continue;
                };
                if (!req.job.is_empty() && key.job != req.job)
                    || (!req.profile_type.is_empty() && key.tp != req.profile_type)
                    || (!req.instance.is_empty() && key.instance != req.instance)
                {
                    return VisitResult::Continue;
                }

                frame_bytes += v.len();
                frame.push(ProfileRecord {
                    timestamp_unix_ms: key.ts,
                    job: key.job,
                    profile_type: key.tp,
                    instance: key.instance,
                    raw_profile: v.to_vec(),
                });

                if frame_bytes >= MAX_BYTES_PER_FRAME {
                    let records = std::mem::take(&mut frame);
                    frame_bytes = 0;
                    if tx.blocking_send(Ok(ReadRangeResponse { records })).is_err() {
                        return VisitResult::Stop;
                    }
                }
                VisitResult::Continue
            });

            if let Err(e) = result {
                let _ = tx.blocking_send(Err(Status::internal(e.to_string())));
                return;
            }
            if !frame.is_empty() {
                let _ = tx.blocking_send(Ok(ReadRangeResponse { records: frame }));
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
