//! 提供物理地址包装

use core::convert::TryFrom;
use core::result::Result;

use crate::consts::PGSIZE;

/// 地址类型通用接口
///
/// 定义地址共有的操作方法，包括页对齐调整、地址转换等。
pub trait Addr {
    /// 获取内部地址值的不可变引用
    fn data_ref(&self) -> &usize;

    /// 获取内部地址值的可变引用
    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    /// 向下取整到页边界
    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = *self.data_mut() & !(PGSIZE - 1)
    }

    /// 增加一页大小（PGSIZE）
    ///
    /// # 注意
    /// 不检查地址是否合法，调用者需确保操作后地址有效
    #[inline]
    fn add_page(&mut self) {
        *self.data_mut() += PGSIZE;
    }

    /// 获取地址的usize表示
    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    /// 转换为只读裸指针
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        *self.data_ref() as *const u8
    }

    /// 转换为可变裸指针
    ///
    /// # 安全性
    /// 调用者需确保指针修改不会破坏内存安全
    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 物理地址封装类型
///
/// # 合法性保证
/// 通过`TryFrom`构造的地址必须页对齐；
/// 是否落在分配器管理的范围内由`kfree`检查。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// 从原始usize值构造物理地址
    ///
    /// # 安全性
    /// 调用者必须确保`raw`是有效的物理地址，不做对齐检查
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// 解封装获取原始物理地址
    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    /// 尝试从usize创建物理地址，地址必须页对齐
    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr addr not aligned");
        }
        Ok(PhysAddr(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_from_rejects_unaligned() {
        assert!(PhysAddr::try_from(PGSIZE * 3).is_ok());
        assert_eq!(
            PhysAddr::try_from(PGSIZE + 8),
            Err("PhysAddr addr not aligned")
        );
    }

    #[test]
    fn rounding() {
        let mut pa = unsafe { PhysAddr::from_raw(PGSIZE + 1) };
        pa.pg_round_up();
        assert_eq!(pa.as_usize(), 2 * PGSIZE);
        pa.add_page();
        assert_eq!(pa.as_usize(), 3 * PGSIZE);

        let mut pa = unsafe { PhysAddr::from_raw(2 * PGSIZE - 1) };
        pa.pg_round_down();
        assert_eq!(pa.into_raw(), PGSIZE);
    }
}
