//! 类型转换
//!
//! OpenCV 容器与 [ndarray] / [nalgebra] 之间的转换

use anyhow::{ensure, Result};
use nalgebra::Matrix3;
use ndarray::ArrayView2;
use opencv::core::{Mat, Point2f, Scalar, Vector, CV_64F, CV_8UC1};
use opencv::prelude::*;

/// 将 3x3 [Mat] 转换为 [Matrix3]，形状或类型不符时返回 `None`
pub fn mat_to_matrix3(mat: &Mat) -> Result<Option<Matrix3<f64>>> {
    if mat.rows() != 3 || mat.cols() != 3 || mat.typ() != CV_64F {
        return Ok(None);
    }
    let mut matrix = Matrix3::<f64>::zeros();
    for i in 0..3 {
        for j in 0..3 {
            matrix[(i, j)] = *mat.at_2d::<f64>(i as i32, j as i32)?;
        }
    }
    Ok(Some(matrix))
}

/// 将灰度 [ArrayView2] 复制为 `CV_8UC1` [Mat]
pub fn gray_array_to_mat(array: ArrayView2<u8>) -> Result<Mat> {
    let (rows, cols) = array.dim();
    ensure!(rows > 0 && cols > 0, "image is empty ({}x{})", cols, rows);
    let mut mat =
        Mat::new_rows_cols_with_default(rows as i32, cols as i32, CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?
        .iter_mut()
        .zip(array.iter())
        .for_each(|(dst, src)| *dst = *src);
    Ok(mat)
}

#[inline]
pub fn points_to_vector(points: &[Point2f]) -> Vector<Point2f> {
    points.iter().copied().collect()
}

#[inline]
pub fn vector_to_points(vector: &Vector<Point2f>) -> Vec<Point2f> {
    vector.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_mat_to_matrix3() {
        let mat =
            Mat::from_slice_2d(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]).unwrap();
        let matrix = mat_to_matrix3(&mat).unwrap().unwrap();
        assert_eq!(matrix[(0, 2)], 3.0);
        assert_eq!(matrix[(2, 0)], 7.0);

        let wrong = Mat::from_slice_2d(&[[1.0, 0.0], [0.0, 1.0]]).unwrap();
        assert!(mat_to_matrix3(&wrong).unwrap().is_none());
        assert!(mat_to_matrix3(&Mat::default()).unwrap().is_none());
    }

    #[test]
    fn test_gray_array_round_trip() {
        let array = Array2::from_shape_fn((4, 6), |(y, x)| (y * 10 + x) as u8);
        let mat = gray_array_to_mat(array.view()).unwrap();
        assert_eq!(mat.rows(), 4);
        assert_eq!(mat.cols(), 6);
        assert_eq!(*mat.at_2d::<u8>(3, 5).unwrap(), 35);
        assert_eq!(mat.data_bytes().unwrap(), array.as_slice().unwrap());
    }

    #[test]
    fn test_empty_array_is_rejected() {
        let array = Array2::<u8>::zeros((0, 5));
        assert!(gray_array_to_mat(array.view()).is_err());
    }

    #[test]
    fn test_points_vector() {
        let points = vec![Point2f::new(1.0, 2.0), Point2f::new(3.5, 4.5)];
        let vector = points_to_vector(&points);
        assert_eq!(vector.len(), 2);
        assert_eq!(vector_to_points(&vector), points);
    }
}
