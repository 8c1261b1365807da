//! OpenCV glue: JPEG codec, mask rasterization and frame annotation.

use opencv::core::{self, Mat, Point as CvPoint, Rect, Scalar, Size, Vector};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;

use super::events::{Zone, ZonedDetection};
use super::geometry::Mask;

const DARKEN_FACTOR: f64 = 0.4;
const BOX_COLOR: (u8, u8, u8) = (0, 0, 255);

pub fn decode_jpeg(bytes: &[u8]) -> opencv::Result<Mat> {
    let buf = Vector::<u8>::from_slice(bytes);
    imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)
}

pub fn encode_jpeg(mat: &Mat, quality: i32) -> Option<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    imgcodecs::imencode(".jpg", mat, &mut buf, &params).ok()?;
    Some(buf.to_vec())
}

/// Decodes a mask image; any nonzero pixel is in-region.
pub fn decode_mask(bytes: &[u8]) -> opencv::Result<Option<Mask>> {
    let buf = Vector::<u8>::from_slice(bytes);
    let gray = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_GRAYSCALE)?;
    if gray.empty() {
        return Ok(None);
    }
    mat_to_mask(&gray)
}

pub fn rasterize_mask(width: u32, height: u32, zones: &[Zone]) -> opencv::Result<Option<Mask>> {
    let mut canvas =
        Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC1, Scalar::all(0.0))?;
    let polygons = zone_polylines(zones);
    if !polygons.is_empty() {
        imgproc::fill_poly(
            &mut canvas,
            &polygons,
            Scalar::all(255.0),
            imgproc::LINE_8,
            0,
            CvPoint::new(0, 0),
        )?;
    }
    mat_to_mask(&canvas)
}

/// Nearest-neighbour resize so the mask lines up with the frame.
pub fn fit_mask(mask: Mask, width: u32, height: u32) -> opencv::Result<Option<Mask>> {
    if mask.width() == width && mask.height() == height {
        return Ok(Some(mask));
    }
    let src = mask_to_mat(&mask)?;
    let mut dst = Mat::default();
    imgproc::resize(
        &src,
        &mut dst,
        Size::new(width as i32, height as i32),
        0.0,
        0.0,
        imgproc::INTER_NEAREST,
    )?;
    mat_to_mask(&dst)
}

/// Blacks out everything outside the mask. The mask must match the frame size.
pub fn apply_mask(frame: &Mat, mask: &Mask) -> opencv::Result<Mat> {
    let mask_mat = mask_to_mat(mask)?;
    let mut out = Mat::default();
    core::bitwise_and(frame, frame, &mut out, &mask_mat)?;
    Ok(out)
}

pub fn darken(frame: &Mat) -> opencv::Result<Mat> {
    let mut out = Mat::default();
    frame.convert_to(&mut out, -1, DARKEN_FACTOR, 0.0)?;
    Ok(out)
}

pub fn annotate(frame: &mut Mat, zones: &[Zone], detections: &[ZonedDetection]) -> opencv::Result<()> {
    for zone in zones {
        let mut outline = Vector::<Vector<CvPoint>>::new();
        outline.push(polygon_points(zone));
        let color = bgr(zone.color);
        imgproc::polylines(frame, &outline, true, color, 2, imgproc::LINE_8, 0)?;
        if let Some(first) = zone.polygon.points().first() {
            imgproc::put_text(
                frame,
                &zone.name,
                CvPoint::new(first.x as i32, (first.y as i32 - 6).max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.6,
                color,
                2,
                imgproc::LINE_8,
                false,
            )?;
        }
    }

    for d in detections {
        let rect = Rect::new(
            d.rect.x1 as i32,
            d.rect.y1 as i32,
            d.rect.width() as i32,
            d.rect.height() as i32,
        );
        imgproc::rectangle(frame, rect, bgr(BOX_COLOR), 2, imgproc::LINE_8, 0)?;
        let caption = format!("{} {:.2}", d.label, d.confidence);
        imgproc::put_text(
            frame,
            &caption,
            CvPoint::new(rect.x, (rect.y - 6).max(12)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            bgr(BOX_COLOR),
            1,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}

fn bgr((b, g, r): (u8, u8, u8)) -> Scalar {
    Scalar::new(b as f64, g as f64, r as f64, 0.0)
}

fn polygon_points(zone: &Zone) -> Vector<CvPoint> {
    zone.polygon
        .points()
        .iter()
        .map(|p| CvPoint::new(p.x.round() as i32, p.y.round() as i32))
        .collect()
}

fn zone_polylines(zones: &[Zone]) -> Vector<Vector<CvPoint>> {
    zones.iter().map(polygon_points).collect()
}

fn mask_to_mat(mask: &Mask) -> opencv::Result<Mat> {
    let flat = Mat::from_slice(mask.data())?;
    let shaped = flat.reshape(1, mask.height() as i32)?;
    shaped.try_clone()
}

fn mat_to_mask(mat: &Mat) -> opencv::Result<Option<Mask>> {
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };
    let data = mat.data_bytes()?.to_vec();
    Ok(Mask::new(mat.cols() as u32, mat.rows() as u32, data))
}
