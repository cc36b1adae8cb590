use crate::{
    error::{StorageError, StorageResult},
    util::{read_u32, read_u64, write_u32, write_u64},
};

/// Fixed-width field types a vector record is built from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldType {
    UInt32,
    Int32,
    UInt64,
}

impl FieldType {
    pub fn get_size(self) -> usize {
        match self {
            FieldType::UInt32 => 4,
            FieldType::Int32 => 4,
            FieldType::UInt64 => 8,
        }
    }
}

/// One field value. Null is stored as all-0xFF bytes, which removes those
/// byte patterns from the value domain: `-1` for signed fields and the
/// unsigned maximum are rejected on insert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Value {
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Null,
}

pub type DataArray = Vec<Value>;

/// Fixed record layout of one vector file.
#[derive(Clone, Debug)]
pub struct DataSchema {
    fields: Vec<FieldType>,
    offsets: Vec<usize>,
    record_size: usize,
}

impl DataSchema {
    pub fn new(fields: Vec<FieldType>) -> StorageResult<Self> {
        if fields.is_empty() {
            return Err(StorageError::bad_argument(
                "a vector record needs at least one field",
            ));
        }
        let mut offsets = Vec::with_capacity(fields.len());
        let mut record_size = 0;
        for f in &fields {
            offsets.push(record_size);
            record_size += f.get_size();
        }
        Ok(Self {
            fields,
            offsets,
            record_size,
        })
    }

    pub fn get_record_size(&self) -> usize {
        self.record_size
    }

    pub fn get_field_count(&self) -> usize {
        self.fields.len()
    }

    fn field_range(&self, index: usize) -> (usize, usize) {
        let start = self.offsets[index];
        (start, start + self.fields[index].get_size())
    }

    fn check_value(&self, index: usize, value: &Value) -> StorageResult<()> {
        let reserved = match (self.fields[index], value) {
            (_, Value::Null) => false,
            (FieldType::UInt32, Value::UInt32(v)) => *v == u32::MAX,
            (FieldType::Int32, Value::Int32(v)) => *v == -1,
            (FieldType::UInt64, Value::UInt64(v)) => *v == u64::MAX,
            _ => {
                return Err(StorageError::bad_argument(format!(
                    "value {:?} does not match field {} ({:?})",
                    value, index, self.fields[index]
                )))
            }
        };
        if reserved {
            // indistinguishable from the null fill on disk
            return Err(StorageError::bad_argument(format!(
                "value {:?} is reserved as the null sentinel",
                value
            )));
        }
        Ok(())
    }

    /// Full-record validation for insert: arity, types, reserved
    /// sentinels, and at least one non-null field (an all-null record
    /// would read back as an empty slot).
    pub fn validate_record(&self, values: &[Value]) -> StorageResult<()> {
        if values.len() != self.fields.len() {
            return Err(StorageError::bad_argument(format!(
                "record has {} fields, schema has {}",
                values.len(),
                self.fields.len()
            )));
        }
        for (i, v) in values.iter().enumerate() {
            self.check_value(i, v)?;
        }
        if values.iter().all(|v| *v == Value::Null) {
            return Err(StorageError::bad_argument(
                "an all-null record cannot be stored",
            ));
        }
        Ok(())
    }

    pub fn write_field(
        &self,
        record: &mut [u8],
        index: usize,
        value: &Value,
    ) -> StorageResult<()> {
        self.check_value(index, value)?;
        let (start, end) = self.field_range(index);
        match value {
            Value::Null => record[start..end].fill(0xff),
            Value::UInt32(v) => write_u32(record, start, *v),
            Value::Int32(v) => write_u32(record, start, *v as u32),
            Value::UInt64(v) => write_u64(record, start, *v),
        }
        Ok(())
    }

    pub fn read_field(&self, record: &[u8], index: usize) -> Value {
        let (start, end) = self.field_range(index);
        if record[start..end].iter().all(|b| *b == 0xff) {
            return Value::Null;
        }
        match self.fields[index] {
            FieldType::UInt32 => Value::UInt32(read_u32(record, start)),
            FieldType::Int32 => Value::Int32(read_u32(record, start) as i32),
            FieldType::UInt64 => Value::UInt64(read_u64(record, start)),
        }
    }

    /// A slot whose every byte is 0xFF holds no record.
    pub fn is_null_record(&self, record: &[u8]) -> bool {
        record[..self.record_size].iter().all(|b| *b == 0xff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DataSchema {
        DataSchema::new(vec![
            FieldType::UInt32,
            FieldType::Int32,
            FieldType::UInt64,
        ])
        .unwrap()
    }

    #[test]
    fn test_layout() {
        let s = schema();
        assert_eq!(s.get_record_size(), 16);
        assert_eq!(s.get_field_count(), 3);
    }

    #[test]
    fn test_round_trip() {
        let s = schema();
        let mut rec = vec![0xffu8; 16];
        s.write_field(&mut rec, 0, &Value::UInt32(7)).unwrap();
        s.write_field(&mut rec, 1, &Value::Int32(-5)).unwrap();
        s.write_field(&mut rec, 2, &Value::UInt64(1 << 40)).unwrap();

        assert_eq!(s.read_field(&rec, 0), Value::UInt32(7));
        assert_eq!(s.read_field(&rec, 1), Value::Int32(-5));
        assert_eq!(s.read_field(&rec, 2), Value::UInt64(1 << 40));
        assert!(!s.is_null_record(&rec));
    }

    #[test]
    fn test_null_encoding() {
        let s = schema();
        let mut rec = vec![0u8; 16];
        s.write_field(&mut rec, 0, &Value::Null).unwrap();
        assert_eq!(s.read_field(&rec, 0), Value::Null);

        let all_ff = vec![0xffu8; 16];
        assert!(s.is_null_record(&all_ff));
    }

    #[test]
    fn test_reserved_sentinels_rejected() {
        let s = schema();
        let mut rec = vec![0u8; 16];
        assert!(s.write_field(&mut rec, 0, &Value::UInt32(u32::MAX)).is_err());
        assert!(s.write_field(&mut rec, 1, &Value::Int32(-1)).is_err());
        assert!(s.write_field(&mut rec, 2, &Value::UInt64(u64::MAX)).is_err());
    }

    #[test]
    fn test_validate_record() {
        let s = schema();
        assert!(s
            .validate_record(&[
                Value::UInt32(1),
                Value::Null,
                Value::UInt64(2)
            ])
            .is_ok());
        // wrong arity
        assert!(s.validate_record(&[Value::UInt32(1)]).is_err());
        // wrong type
        assert!(s
            .validate_record(&[
                Value::Int32(1),
                Value::Null,
                Value::UInt64(2)
            ])
            .is_err());
        // all null
        assert!(s
            .validate_record(&[Value::Null, Value::Null, Value::Null])
            .is_err());
    }
}
