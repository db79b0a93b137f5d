use crate::error::{Error, ErrorKind, Operation};
use crate::proto::{Request, Response, ZkError};
use crate::{Stat, TransactionResult};

/// Maps a wire error that carries no operation-specific meaning.
fn other(e: ZkError) -> ErrorKind {
    match e {
        ZkError::ConnectionLoss => ErrorKind::ConnectionLoss,
        ZkError::SessionExpired => ErrorKind::SessionExpired,
        ZkError::BadArguments => ErrorKind::BadArguments("rejected by the ensemble".to_string()),
        e => ErrorKind::Unexpected(e),
    }
}

fn unexpected(op: &str, r: Response) -> ErrorKind {
    ErrorKind::Protocol(format!("got unexpected response to {}: {:?}", op, r))
}

pub(crate) fn create(res: Result<Response, ZkError>) -> Result<String, ErrorKind> {
    match res {
        Ok(Response::String(s)) => Ok(s),
        Ok(r) => Err(unexpected("create", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(ZkError::NodeExists) => Err(ErrorKind::NodeExists),
        Err(ZkError::NoChildrenForEphemerals) => Err(ErrorKind::NoChildrenForEphemerals),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn set_data(version: i32, res: Result<Response, ZkError>) -> Result<Stat, ErrorKind> {
    match res {
        Ok(Response::Stat(stat)) => Ok(stat),
        Ok(r) => Err(unexpected("set_data", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(ZkError::BadVersion) => Err(ErrorKind::BadVersion { expected: version }),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn delete(version: i32, res: Result<Response, ZkError>) -> Result<(), ErrorKind> {
    match res {
        Ok(Response::Empty) => Ok(()),
        Ok(r) => Err(unexpected("delete", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(ZkError::NotEmpty) => Err(ErrorKind::NotEmpty),
        Err(ZkError::BadVersion) => Err(ErrorKind::BadVersion { expected: version }),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn exists(res: Result<Response, ZkError>) -> Result<Option<Stat>, ErrorKind> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Some(stat)),
        Ok(r) => Err(unexpected("exists", r)),
        Err(ZkError::NoNode) => Ok(None),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn get_children(res: Result<Response, ZkError>) -> Result<Vec<String>, ErrorKind> {
    match res {
        Ok(Response::Strings(children)) => Ok(children),
        Ok(r) => Err(unexpected("get_children", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn get_data(res: Result<Response, ZkError>) -> Result<(Vec<u8>, Stat), ErrorKind> {
    match res {
        Ok(Response::GetData { bytes, stat }) => Ok((bytes, stat)),
        Ok(r) => Err(unexpected("get_data", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(e) => Err(other(e)),
    }
}

pub(crate) fn check(version: i32, res: Result<Response, ZkError>) -> Result<(), ErrorKind> {
    match res {
        Ok(Response::Empty) => Ok(()),
        Ok(r) => Err(unexpected("check", r)),
        Err(ZkError::NoNode) => Err(ErrorKind::NoNode),
        Err(ZkError::BadVersion) => Err(ErrorKind::BadVersion { expected: version }),
        Err(e) => Err(other(e)),
    }
}

/// The subset of a [`Request`] that interpreting its part of a multi response needs.
///
/// The requests themselves move into the multi request, so the path and expected version of
/// each operation are kept aside to report which one failed and why.
#[derive(Debug)]
pub(crate) enum RequestMarker {
    Create { path: String },
    SetData { path: String, version: i32 },
    Delete { path: String, version: i32 },
    Check { path: String, version: i32 },
}

impl RequestMarker {
    /// `None` for requests that cannot be part of a transaction.
    pub(crate) fn of(r: &Request) -> Option<RequestMarker> {
        Some(match r {
            Request::Create { path, .. } => RequestMarker::Create { path: path.clone() },
            Request::SetData { path, version, .. } => RequestMarker::SetData {
                path: path.clone(),
                version: *version,
            },
            Request::Delete { path, version } => RequestMarker::Delete {
                path: path.clone(),
                version: *version,
            },
            Request::Check { path, version } => RequestMarker::Check {
                path: path.clone(),
                version: *version,
            },
            _ => return None,
        })
    }

    fn operation(&self) -> Operation {
        match self {
            RequestMarker::Create { .. } => Operation::Create,
            RequestMarker::SetData { .. } => Operation::SetData,
            RequestMarker::Delete { .. } => Operation::Delete,
            RequestMarker::Check { .. } => Operation::Check,
        }
    }

    fn path(&self) -> &str {
        match self {
            RequestMarker::Create { path }
            | RequestMarker::SetData { path, .. }
            | RequestMarker::Delete { path, .. }
            | RequestMarker::Check { path, .. } => path,
        }
    }

    fn interpret(&self, res: Result<Response, ZkError>) -> Result<TransactionResult, ErrorKind> {
        match *self {
            RequestMarker::Create { .. } => create(res).map(TransactionResult::Create),
            RequestMarker::SetData { version, .. } => {
                set_data(version, res).map(TransactionResult::SetData)
            }
            RequestMarker::Delete { version, .. } => {
                delete(version, res).map(|_| TransactionResult::Delete)
            }
            RequestMarker::Check { version, .. } => {
                check(version, res).map(|_| TransactionResult::Check)
            }
        }
    }
}

/// Interprets the response to a multi request built from `markers`.
///
/// If any operation failed, the whole transaction fails with the first real failure.
pub(crate) fn multi(
    markers: &[RequestMarker],
    res: Result<Response, ZkError>,
) -> Result<Vec<TransactionResult>, ErrorKind> {
    let results = match res {
        Ok(Response::Multi(results)) => results,
        Ok(r) => return Err(unexpected("multi", r)),
        Err(e) => return Err(other(e)),
    };
    if results.len() != markers.len() {
        return Err(ErrorKind::Protocol(format!(
            "multi response has {} results for {} operations",
            results.len(),
            markers.len()
        )));
    }

    // Operations that would have succeeded report Ok, and the ones after the failure report
    // RuntimeInconsistency. Neither is the reason the transaction failed.
    let failed = results.iter().position(|r| {
        !matches!(
            r,
            Ok(_) | Err(ZkError::Ok) | Err(ZkError::RuntimeInconsistency)
        )
    });
    if let Some(i) = failed {
        let marker = &markers[i];
        let cause = match marker.interpret(results[i].clone()) {
            Err(kind) => kind,
            Ok(_) => ErrorKind::Protocol("failed operation reported success".to_string()),
        };
        return Err(ErrorKind::Transaction {
            failed_index: i,
            cause: Box::new(Error::new(marker.operation(), marker.path(), cause)),
        });
    }

    results
        .into_iter()
        .zip(markers)
        .map(|(r, marker)| marker.interpret(r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<RequestMarker> {
        vec![
            RequestMarker::Create {
                path: "/t".to_string(),
            },
            RequestMarker::SetData {
                path: "/t".to_string(),
                version: 3,
            },
            RequestMarker::Delete {
                path: "/u".to_string(),
                version: -1,
            },
        ]
    }

    #[test]
    fn single_operation_mapping() {
        assert_eq!(create(Err(ZkError::NodeExists)), Err(ErrorKind::NodeExists));
        assert_eq!(
            set_data(4, Err(ZkError::BadVersion)),
            Err(ErrorKind::BadVersion { expected: 4 })
        );
        assert_eq!(exists(Err(ZkError::NoNode)), Ok(None));
        assert_eq!(get_data(Err(ZkError::NoNode)), Err(ErrorKind::NoNode));
        assert_eq!(delete(0, Err(ZkError::NotEmpty)), Err(ErrorKind::NotEmpty));
        assert_eq!(
            delete(0, Err(ZkError::ConnectionLoss)),
            Err(ErrorKind::ConnectionLoss)
        );
        assert_eq!(
            get_children(Err(ZkError::NoAuth)),
            Err(ErrorKind::Unexpected(ZkError::NoAuth))
        );
        assert!(matches!(
            create(Ok(Response::Empty)),
            Err(ErrorKind::Protocol(_))
        ));
    }

    #[test]
    fn successful_multi() {
        let res = Ok(Response::Multi(vec![
            Ok(Response::String("/t".to_string())),
            Ok(Response::Stat(Stat {
                version: 4,
                ..Stat::default()
            })),
            Ok(Response::Empty),
        ]));
        let results = multi(&markers(), res).unwrap();
        assert_eq!(results[0], TransactionResult::Create("/t".to_string()));
        assert!(matches!(results[1], TransactionResult::SetData(Stat { version: 4, .. })));
        assert_eq!(results[2], TransactionResult::Delete);
    }

    #[test]
    fn failed_multi_reports_first_real_failure() {
        let res = Ok(Response::Multi(vec![
            Err(ZkError::Ok),
            Err(ZkError::BadVersion),
            Err(ZkError::RuntimeInconsistency),
        ]));
        match multi(&markers(), res) {
            Err(ErrorKind::Transaction {
                failed_index,
                cause,
            }) => {
                assert_eq!(failed_index, 1);
                assert_eq!(cause.operation(), Operation::SetData);
                assert_eq!(cause.path(), "/t");
                assert_eq!(*cause.kind(), ErrorKind::BadVersion { expected: 3 });
            }
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn mismatched_multi_is_a_protocol_error() {
        let res = Ok(Response::Multi(vec![Ok(Response::Empty)]));
        assert!(matches!(
            multi(&markers(), res),
            Err(ErrorKind::Protocol(_))
        ));
    }
}
