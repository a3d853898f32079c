use dataplane_core::{DataplaneError, ErrorKind, MemoryServices, Result, error::codes};
use parking_lot::RwLock;

/// 一块进程内共享内存，字节按小端序解释。
///
/// 读写都做边界检查，越界返回 [`codes::OUT_OF_BOUNDS`]。
pub struct Segment {
    bytes: RwLock<Vec<u8>>,
}

impl Segment {
    pub fn new(size: u64) -> Self {
        Self {
            bytes: RwLock::new(vec![0; size as usize]),
        }
    }

    fn check(&self, offset: u64, len: usize, limit: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok();
        match start.and_then(|start| start.checked_add(len).map(|end| start..end)) {
            Some(range) if range.end <= limit => Ok(range),
            _ => Err(DataplaneError::new(
                codes::OUT_OF_BOUNDS,
                ErrorKind::InvalidArgument,
                format!("access [{offset}, +{len}) exceeds {limit} bytes"),
            )),
        }
    }

    /// 段内拷贝，源与目标区间可以重叠。
    pub fn copy_within(&self, from: u64, to: u64, len: u64) -> Result<()> {
        let mut bytes = self.bytes.write();
        let limit = bytes.len();
        let src = self.check(from, len as usize, limit)?;
        let dst = self.check(to, len as usize, limit)?;
        bytes.copy_within(src, dst.start);
        Ok(())
    }
}

impl MemoryServices for Segment {
    fn size(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let range = self.check(offset, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let limit = bytes.len();
        let range = self.check(offset, src.len(), limit)?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("size", &self.size()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let segment = Segment::new(64);
        segment.write_u32(4, 0x0102_0304).expect("写入");
        let mut raw = [0u8; 4];
        segment.read(4, &mut raw).expect("读取");
        assert_eq!(raw, [4, 3, 2, 1]);
        segment.write_u64(8, u64::MAX - 1).expect("写入");
        assert_eq!(segment.read_u64(8).expect("读取"), u64::MAX - 1);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let segment = Segment::new(16);
        let err = segment.write(12, &[0; 8]).expect_err("越界写");
        assert_eq!(err.code(), codes::OUT_OF_BOUNDS);
        assert!(segment.read(u64::MAX, &mut [0; 1]).is_err());
        assert!(segment.copy_within(0, 10, 8).is_err());
    }

    #[test]
    fn copy_within_handles_overlap() {
        let segment = Segment::new(8);
        segment.write(0, &[1, 2, 3, 4]).expect("写入");
        segment.copy_within(0, 2, 4).expect("重叠拷贝");
        let mut raw = [0u8; 6];
        segment.read(0, &mut raw).expect("读取");
        assert_eq!(raw, [1, 2, 1, 2, 3, 4]);
    }
}
