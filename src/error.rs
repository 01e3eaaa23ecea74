use thiserror::Error;

use crate::tree::NodeKind;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Неверная сигнатура: это не файл KeePass или неподдерживаемое поколение формата")]
    SignatureMismatch,

    #[error("Неподдерживаемая версия формата: {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("Неизвестный алгоритм: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Неизвестный шифр: {0}")]
    UnsupportedCipher(String),

    #[error("Неверный пароль или ключевой файл")]
    InvalidCredentials,

    #[error("Пустой ключ: задайте пароль, ключевой файл или аппаратный ключ")]
    EmptyCredential,

    #[error("Ошибка ключевого файла: {0}")]
    KeyFile(String),

    #[error("Недопустимый параметр KDF: {0}")]
    InvalidKdfParameter(String),

    #[error("Недостаточно памяти для вычисления ключа ({0} КиБ)")]
    OutOfMemoryDuringKdf(u64),

    #[error("Нарушена целостность блока {0}")]
    IntegrityCheckFailed(u64),

    #[error("Повреждённый поток: {0}")]
    MalformedStream(String),

    #[error("Повреждённый документ: {0}")]
    MalformedDocument(String),

    #[error("Повторяющийся идентификатор {kind}: {id}")]
    DuplicateIdentifier { kind: NodeKind, id: String },

    #[error("Группа не может быть перемещена в собственного потомка")]
    CyclicMove,

    #[error("Узел '{0}' не найден")]
    NodeNotFound(String),

    #[error("База открыта только для чтения")]
    ReadOnly,

    #[error("Операция отменена пользователем")]
    Cancelled,

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    /// Credential failures are the only ones worth retrying with another key.
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            DatabaseError::InvalidCredentials | DatabaseError::EmptyCredential | DatabaseError::KeyFile(_)
        )
    }
}

impl From<quick_xml::Error> for DatabaseError {
    fn from(e: quick_xml::Error) -> Self {
        DatabaseError::MalformedDocument(e.to_string())
    }
}
